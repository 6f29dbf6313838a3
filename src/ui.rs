//! Interface de terminal do jobline: spinner e saída colorida.
//!
//! Usa as crates `indicatif` para o spinner de progresso e `console` para
//! estilização com cores. O [`RunProgress`] acompanha visualmente um job dos
//! subcomandos `run` e `demo` até ele chegar a um estado terminal.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};
use uuid::Uuid;

use jobline::job::{JobSnapshot, JobStatus};

/// Indicador visual de progresso de um job no terminal.
///
/// Exibe um spinner com o status atual enquanto o job é processado e, ao
/// final, uma linha colorida (verde para sucesso, vermelho para falha)
/// seguida da resposta de consulta em JSON.
pub struct RunProgress {
    // Spinner do indicatif.
    pb: ProgressBar,
    // Estilo verde para jobs concluídos.
    green: Style,
    // Estilo vermelho para jobs falhos.
    red: Style,
    // Estilo esmaecido para separadores e estados não terminais.
    dim: Style,
}

impl RunProgress {
    /// Inicia o spinner para o job `job_id`, ainda na fila.
    pub fn start(job_id: Uuid) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg} [{elapsed}]") {
            pb.set_style(style);
        }
        pb.set_message(format!("job {job_id}: {}", JobStatus::Queued));
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            dim: Style::new().dim(),
        }
    }

    /// Atualiza a mensagem do spinner com o status consultado.
    pub fn update(&self, job_id: Uuid, status: JobStatus) {
        self.pb.set_message(format!("job {job_id}: {status}"));
    }

    /// Para o spinner e imprime o resultado final da consulta.
    pub fn finish(&self, job_id: Uuid, snapshot: &JobSnapshot) {
        self.pb.finish_and_clear();
        match snapshot.status {
            JobStatus::Completed => {
                println!("  {} Job {job_id} completed", self.green.apply_to("✓"));
            }
            JobStatus::Failed => {
                println!(
                    "  {} Job {job_id} failed: {}",
                    self.red.apply_to("✗"),
                    snapshot.error.as_deref().unwrap_or("unknown error")
                );
            }
            status => {
                println!("  {} Job {job_id} left {status}", self.dim.apply_to("…"));
            }
        }
        println!();
        println!("{}", self.dim.apply_to("─── Result ───"));
        println!(
            "{}",
            serde_json::to_string_pretty(snapshot).unwrap_or_default()
        );
    }
}
