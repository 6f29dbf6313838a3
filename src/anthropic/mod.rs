//! Cliente da API Anthropic Messages, o executor de estágios de produção.
//!
//! - [`client`]: envio das requisições e implementação de `StageExecutor`
//! - [`error`]: erros do cliente e sua classificação
//! - [`types`]: corpos JSON de requisição e resposta

pub mod client;
pub mod error;
pub mod types;

pub use client::AnthropicClient;
pub use error::AnthropicError;
