//! Configuração do jobline carregada a partir de `jobline.toml`.
//!
//! A struct [`JoblineConfig`] contém todos os parâmetros ajustáveis do serviço:
//! credenciais do modelo, tamanho do pool de workers, capacidade do gate,
//! prazos e a lista de estágios do pipeline. Campos ausentes no arquivo usam
//! defaults sensíveis. A variável de ambiente `ANTHROPIC_API_KEY` tem
//! precedência sobre o arquivo, e o binário aplica as flags da CLI por cima
//! de ambos antes de chamar [`JoblineConfig::validate`].

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::JoblineError;
use crate::job::RESERVED_NAMES;
use crate::stage::{StageSpec, default_stages};

/// Nome do arquivo de configuração procurado no diretório atual.
pub const CONFIG_FILE: &str = "jobline.toml";

/// Configuração de nível superior carregada de `jobline.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct JoblineConfig {
    /// Chave da API Anthropic. Vazia significa usar o executor roteirizado.
    #[serde(default)]
    pub api_key: String,

    /// Identificador do modelo usado por todos os estágios.
    #[serde(default = "default_model")]
    pub model: String,

    /// Máximo de tokens na resposta de cada estágio.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Tamanho do pool de workers. `None` usa o número de CPUs disponíveis.
    #[serde(default)]
    pub workers: Option<usize>,

    /// Execuções de pipeline permitidas contra o modelo ao mesmo tempo.
    #[serde(default = "default_gate_capacity")]
    pub gate_capacity: usize,

    /// Prazo de um único estágio, em segundos.
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,

    /// Prazo da cadeia de estágios de um job, em segundos. Começa a contar
    /// quando o gate admite a execução, não enquanto o job espera por ele.
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    /// Quanto o shutdown espera pelas execuções em andamento antes de abortá-las.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Prazo do download de cada link do payload, em segundos.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    /// Caracteres da saída bruta de um estágio citados em erros de parsing.
    #[serde(default = "default_excerpt_chars")]
    pub excerpt_chars: usize,

    /// Limite em bytes do texto inline de um payload. Vale também para cada
    /// documento baixado a partir de um link.
    #[serde(default = "default_max_input_bytes")]
    pub max_input_bytes: usize,

    /// Endereço de escuta da API HTTP.
    #[serde(default)]
    pub server: ServerConfig,

    /// Estágios do pipeline, na ordem de execução.
    #[serde(default = "default_stages")]
    pub stages: Vec<StageSpec>,
}

/// Seção `[server]`: onde a API HTTP escuta.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host ou IP de escuta.
    #[serde(default = "default_host")]
    pub host: String,
    /// Porta TCP de escuta.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    /// Endereço no formato `host:porta`, pronto para o bind.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// Valor padrão para o modelo: Sonnet 4.5.
fn default_model() -> String {
    "claude-sonnet-4-5-20250929".to_string()
}

// Valor padrão para tokens de resposta: 4096.
fn default_max_tokens() -> u32 {
    4096
}

// Valor padrão para o gate: uma execução por vez.
fn default_gate_capacity() -> usize {
    1
}

// Valor padrão para o prazo de estágio: 5 minutos.
fn default_stage_timeout_secs() -> u64 {
    300
}

// Valor padrão para o prazo do job: 30 minutos.
fn default_job_timeout_secs() -> u64 {
    1800
}

// Valor padrão para o prazo de shutdown: 30s.
fn default_shutdown_timeout_secs() -> u64 {
    30
}

// Valor padrão para o prazo de download: 60s.
fn default_fetch_timeout_secs() -> u64 {
    60
}

// Valor padrão para o trecho citado em erros: 200 caracteres.
fn default_excerpt_chars() -> usize {
    200
}

// Valor padrão para o limite de entrada: 10 MB.
fn default_max_input_bytes() -> usize {
    10 * 1024 * 1024
}

// Valor padrão para o host: apenas loopback.
fn default_host() -> String {
    "127.0.0.1".to_string()
}

// Valor padrão para a porta: 8080.
fn default_port() -> u16 {
    8080
}

impl Default for JoblineConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            workers: None,
            gate_capacity: default_gate_capacity(),
            stage_timeout_secs: default_stage_timeout_secs(),
            job_timeout_secs: default_job_timeout_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            excerpt_chars: default_excerpt_chars(),
            max_input_bytes: default_max_input_bytes(),
            server: ServerConfig::default(),
            stages: default_stages(),
        }
    }
}

impl JoblineConfig {
    /// Carrega a configuração de `jobline.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self, JoblineError> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    /// Carrega a configuração de `path`, aplica `ANTHROPIC_API_KEY` e valida.
    pub fn load_from(path: &Path) -> Result<Self, JoblineError> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<JoblineConfig>(&contents)?
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo para a chave API.
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY")
            && !key.is_empty()
        {
            config.api_key = key;
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejeita combinações que nunca produziriam um serviço funcional:
    /// gate ou pool vazios, prazos zerados e estágios ausentes, repetidos ou
    /// com nomes reservados pelos templates (`previous`, `context`).
    pub fn validate(&self) -> Result<(), JoblineError> {
        if self.gate_capacity == 0 {
            return Err(JoblineError::Config("gate_capacity must be at least 1".into()));
        }
        if self.workers == Some(0) {
            return Err(JoblineError::Config("workers must be at least 1".into()));
        }
        if self.stages.is_empty() {
            return Err(JoblineError::Config("at least one stage is required".into()));
        }
        if self.stage_timeout_secs == 0 || self.job_timeout_secs == 0 {
            return Err(JoblineError::Config("timeouts must be positive".into()));
        }
        for (index, stage) in self.stages.iter().enumerate() {
            if RESERVED_NAMES.contains(&stage.name.as_str()) {
                return Err(JoblineError::Config(format!(
                    "stage name '{}' is reserved",
                    stage.name
                )));
            }
            if self.stages[..index].iter().any(|s| s.name == stage.name) {
                return Err(JoblineError::Config(format!(
                    "stage name '{}' is used twice",
                    stage.name
                )));
            }
        }
        Ok(())
    }

    /// Número efetivo de workers, nunca menor que um.
    pub fn pool_size(&self) -> usize {
        self.workers.unwrap_or_else(num_cpus::get).max(1)
    }

    /// Prazo de cada estágio como [`Duration`].
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    /// Prazo da cadeia de estágios de um job como [`Duration`].
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    /// Prazo total do shutdown do pool como [`Duration`].
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Prazo de download de um link como [`Duration`].
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}
