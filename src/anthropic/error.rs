//! Tipos de erro para o cliente da API Anthropic.
//!
//! Define [`AnthropicError`] com variantes para rate limiting, sobrecarga,
//! erros da API e erros de rede, e a conversão para [`ExecutorError`], que é
//! como o pipeline enxerga falhas de qualquer executor de estágio.

use thiserror::Error;

use crate::executor::ExecutorError;

/// Erros que podem ocorrer ao interagir com a API da Anthropic.
///
/// Rate limit e sobrecarga são passageiros e viram
/// [`ExecutorError::Overloaded`]; erros 5xx e de rede viram
/// [`ExecutorError::Unavailable`]; o restante é uma falha definitiva.
#[derive(Debug, Error)]
pub enum AnthropicError {
    /// O servidor retornou HTTP 429 (rate limit).
    /// O campo `retry_after_ms` vem do cabeçalho `retry-after`.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// O servidor retornou HTTP 529: a API está temporariamente sobrecarregada.
    #[error("API overloaded")]
    Overloaded,

    /// Qualquer outro status de erro (ex.: 401 chave inválida, 500 erro interno).
    /// Contém o código HTTP e o corpo da resposta como mensagem.
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// Falha de rede subjacente (DNS, conexão recusada, timeout).
    /// Encapsula o erro original do `reqwest` via `#[from]`.
    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

/// Classifica o erro do cliente na taxonomia dos executores de estágio.
impl From<AnthropicError> for ExecutorError {
    fn from(err: AnthropicError) -> Self {
        match err {
            AnthropicError::RateLimited { .. } | AnthropicError::Overloaded => {
                ExecutorError::Overloaded(err.to_string())
            }
            AnthropicError::ApiError { status, .. } if status >= 500 => {
                ExecutorError::Unavailable(err.to_string())
            }
            AnthropicError::NetworkError(_) => ExecutorError::Unavailable(err.to_string()),
            AnthropicError::ApiError { .. } => ExecutorError::Failed(err.to_string()),
        }
    }
}
