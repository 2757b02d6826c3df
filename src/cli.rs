//! Interface de linha de comando do FATE baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] para inspecionar e
//! administrar as transações de um armazenamento em arquivos, e flags
//! globais (--config, --store-dir, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::fate::{FateId, TxStatus};

/// FATE: executor tolerante a falhas para operações administrativas longas.
#[derive(Debug, Parser)]
#[command(name = "fate", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração (padrão: `fate.toml`).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Diretório do armazenamento, sobrepõe a configuração.
    #[arg(long, global = true)]
    pub store_dir: Option<PathBuf>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Lista as transações do armazenamento.
    List {
        /// Mostra apenas transações neste status.
        #[arg(long)]
        status: Option<TxStatus>,
    },

    /// Mostra os detalhes de uma transação.
    Show {
        id: FateId,

        /// Imprime o registro completo em JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Mostra a tabela de locks reconstruída a partir dos registros.
    Locks,

    /// Cancela uma transação que ainda não começou a executar.
    Cancel { id: FateId },

    /// Remove uma transação terminada.
    Delete { id: FateId },

    /// Aguarda até a transação terminar.
    Wait { id: FateId },

    /// Executa a demonstração embutida com duas operações concorrentes.
    Demo,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_list_with_status_filter() {
        let cli = Cli::parse_from(["fate", "list", "--status", "failed_in_progress"]);
        match cli.command {
            Command::List { status } => assert_eq!(status, Some(TxStatus::FailedInProgress)),
            _ => panic!("expected List command"),
        }
    }

    #[test]
    fn cli_parses_fate_ids() {
        let cli = Cli::parse_from([
            "fate",
            "show",
            "FATE:0190f0c4-9e1c-7b3a-8d2e-3f4a5b6c7d8e",
            "--json",
        ]);
        match cli.command {
            Command::Show { id, json } => {
                assert!(json);
                assert_eq!(id.to_string(), "FATE:0190f0c4-9e1c-7b3a-8d2e-3f4a5b6c7d8e");
            }
            _ => panic!("expected Show command"),
        }
        assert!(Cli::try_parse_from(["fate", "cancel", "not-an-id"]).is_err());
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "fate",
            "--store-dir",
            "/var/lib/fate",
            "--config",
            "custom.toml",
            "-v",
            "locks",
        ]);
        assert!(cli.verbose);
        assert_eq!(cli.store_dir, Some(PathBuf::from("/var/lib/fate")));
        assert_eq!(cli.config, Some(PathBuf::from("custom.toml")));
        assert!(matches!(cli.command, Command::Locks));
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
