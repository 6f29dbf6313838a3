//! Interface de linha de comando do jobline baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (serve, run, demo)
//! e flags globais (--workers, --gate-capacity, --config, --verbose) que
//! sobrescrevem os valores de `jobline.toml`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// jobline: fila de jobs de análise executados por um pipeline de estágios.
#[derive(Debug, Parser)]
#[command(name = "jobline", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Número de workers no pool.
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    /// Execuções de pipeline permitidas contra o modelo ao mesmo tempo.
    #[arg(long, global = true)]
    pub gate_capacity: Option<usize>,

    /// Arquivo de configuração (padrão: ./jobline.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Habilita logs de depuração (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

/// Subcomandos disponíveis na CLI.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Inicia o pool de workers e a API HTTP.
    Serve {
        /// Host de escuta (sobrescreve `[server].host`).
        #[arg(long)]
        host: Option<String>,

        /// Porta de escuta (sobrescreve `[server].port`).
        #[arg(long)]
        port: Option<u16>,
    },

    /// Executa um payload (arquivo JSON com `texts` e `links`) e imprime o resultado.
    Run {
        /// Caminho do arquivo JSON do payload.
        payload: PathBuf,
    },

    /// Executa o pipeline embutido com respostas roteirizadas.
    Demo,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_run_subcommand() {
        let cli = Cli::parse_from(["jobline", "run", "payload.json"]);
        match cli.command {
            Command::Run { payload } => assert_eq!(payload, PathBuf::from("payload.json")),
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn cli_parses_serve_overrides() {
        let cli = Cli::parse_from(["jobline", "serve", "--host", "0.0.0.0", "--port", "9000"]);
        match cli.command {
            Command::Serve { host, port } => {
                assert_eq!(host.as_deref(), Some("0.0.0.0"));
                assert_eq!(port, Some(9000));
            }
            _ => panic!("expected Serve command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "jobline",
            "demo",
            "--workers",
            "3",
            "--gate-capacity",
            "2",
            "--config",
            "custom.toml",
            "-v",
        ]);
        assert!(cli.verbose);
        assert_eq!(cli.workers, Some(3));
        assert_eq!(cli.gate_capacity, Some(2));
        assert_eq!(cli.config, Some(PathBuf::from("custom.toml")));
        assert!(matches!(cli.command, Command::Demo));
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
