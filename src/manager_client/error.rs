//! Tipos de erro para o cliente que fala com o controlador.
//!
//! Define [`ClientError`] e a classificação usada pelo laço de retentativa:
//! falhas de transporte e respostas 5xx são retentáveis, host desconhecido
//! é fatal.

use thiserror::Error;

/// Erros que podem ocorrer ao chamar o controlador.
#[derive(Debug, Error)]
pub enum ClientError {
    /// O localizador ainda não conhece o endereço do controlador.
    #[error("controller not available yet")]
    NotAvailable,

    /// O nome do host não resolve. Retentar não adianta.
    #[error("unknown host for {endpoint}: {source}")]
    UnknownHost {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    /// Falha de conexão ou de transporte (conexão recusada, reset).
    #[error("transport error talking to {endpoint}: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    /// O controlador respondeu com status HTTP de erro.
    #[error("controller returned status {status}: {message}")]
    Status { status: u16, message: String },

    /// O corpo da resposta não pôde ser decodificado.
    #[error("invalid response body: {0}")]
    Decode(#[source] reqwest::Error),

    /// O cliente HTTP não pôde ser construído.
    #[error("failed to build HTTP client: {0}")]
    Build(#[source] reqwest::Error),
}

impl ClientError {
    /// Falhas que o chamador deve retentar com backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::NotAvailable | ClientError::Transport { .. } => true,
            ClientError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Falhas que encerram a operação imediatamente.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ClientError::UnknownHost { .. })
    }
}
