//! Configuração do executor carregada a partir de `fate.toml`.
//!
//! A struct [`FateConfig`] contém todos os parâmetros ajustáveis do motor.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `FATE_STORE_DIR` tem precedência sobre o arquivo.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{FateError, Result};
use crate::retry::RetryConfig;

pub const DEFAULT_CONFIG_FILE: &str = "fate.toml";
pub const STORE_DIR_ENV: &str = "FATE_STORE_DIR";

/// O que fazer quando um passo continua não pronto após `max_deferrals`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeferralExhaustion {
    /// Executa o passo mesmo assim.
    Execute,
    /// Marca a operação como falha e desfaz os passos concluídos.
    Fail,
}

/// Configuração de nível superior carregada de `fate.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct FateConfig {
    /// Número de workers concorrentes.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Duração da reserva (lease) de uma transação em milissegundos.
    #[serde(default = "default_lease_duration_ms")]
    pub lease_duration_ms: u64,

    /// Intervalo de renovação da reserva enquanto um passo executa.
    /// Deve ser menor que `lease_duration_ms`.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Intervalo máximo entre varreduras quando não há trabalho.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Atraso base para reagendar uma transação cujo lock está na fila.
    #[serde(default = "default_lock_retry_base_ms")]
    pub lock_retry_base_ms: u64,

    /// Atraso máximo para reagendar uma transação cujo lock está na fila.
    #[serde(default = "default_lock_retry_max_ms")]
    pub lock_retry_max_ms: u64,

    /// Quantas vezes um passo não pronto pode ser adiado.
    #[serde(default = "default_max_deferrals")]
    pub max_deferrals: u32,

    /// Política aplicada quando `max_deferrals` se esgota.
    #[serde(default = "default_on_deferrals_exhausted")]
    pub on_deferrals_exhausted: DeferralExhaustion,

    /// Tamanho máximo do mapa de adiamentos antes de ser esvaziado.
    #[serde(default = "default_max_deferred")]
    pub max_deferred: usize,

    /// Idade a partir da qual transações terminadas são removidas.
    /// Sem valor, nada é removido automaticamente.
    #[serde(default)]
    pub retention_ms: Option<u64>,

    /// Diretório do armazenamento em arquivos.
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,

    /// Retentativas do cliente que localiza o controlador.
    #[serde(default)]
    pub client: RetryConfig,
}

// Valor padrão de workers: 4.
fn default_workers() -> usize {
    4
}

// Valor padrão da reserva: 60s.
fn default_lease_duration_ms() -> u64 {
    60_000
}

// Valor padrão do heartbeat: 15s, um quarto da reserva.
fn default_heartbeat_interval_ms() -> u64 {
    15_000
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_lock_retry_base_ms() -> u64 {
    100
}

fn default_lock_retry_max_ms() -> u64 {
    5_000
}

fn default_max_deferrals() -> u32 {
    100
}

fn default_on_deferrals_exhausted() -> DeferralExhaustion {
    DeferralExhaustion::Execute
}

fn default_max_deferred() -> usize {
    10_000
}

fn default_store_dir() -> PathBuf {
    PathBuf::from(".fate")
}

impl Default for FateConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            lease_duration_ms: default_lease_duration_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            lock_retry_base_ms: default_lock_retry_base_ms(),
            lock_retry_max_ms: default_lock_retry_max_ms(),
            max_deferrals: default_max_deferrals(),
            on_deferrals_exhausted: default_on_deferrals_exhausted(),
            max_deferred: default_max_deferred(),
            retention_ms: None,
            store_dir: default_store_dir(),
            client: RetryConfig::default(),
        }
    }
}

impl FateConfig {
    /// Carrega a configuração de `path`, ou de `fate.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            Self::from_toml(&contents)?
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo de configuração.
        if let Ok(dir) = std::env::var(STORE_DIR_ENV)
            && !dir.is_empty()
        {
            config.store_dir = PathBuf::from(dir);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| FateError::Config(e.to_string()))
    }

    /// Rejeita combinações que tornariam a reserva insegura.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(FateError::Config("workers must be at least 1".into()));
        }
        if self.heartbeat_interval_ms == 0 || self.heartbeat_interval_ms >= self.lease_duration_ms {
            return Err(FateError::Config(format!(
                "heartbeat_interval_ms ({}) must be non-zero and shorter than lease_duration_ms ({})",
                self.heartbeat_interval_ms, self.lease_duration_ms
            )));
        }
        if self.lock_retry_base_ms > self.lock_retry_max_ms {
            return Err(FateError::Config(
                "lock_retry_base_ms must not exceed lock_retry_max_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retention(&self) -> Option<Duration> {
        self.retention_ms.map(Duration::from_millis)
    }

    /// Backoff usado enquanto um lock permanece na fila.
    pub fn lock_retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: u32::MAX,
            base_delay_ms: self.lock_retry_base_ms,
            max_delay_ms: self.lock_retry_max_ms,
        }
    }
}
