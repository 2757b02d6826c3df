//! Interface de terminal do FATE: spinners e saída colorida.
//!
//! Usa as crates `indicatif` para o spinner de espera e `console` para
//! estilização com cores. As tabelas de transações e de locks são
//! impressas por funções deste módulo.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::fate::{FateId, LockState, TxStatus, TxSummary};

/// Cor associada a cada status: verde para sucesso, vermelho para falha,
/// amarelo para desfazendo e ciano para o resto.
pub fn status_style(status: TxStatus) -> Style {
    match status {
        TxStatus::Successful => Style::new().green().bold(),
        TxStatus::Failed => Style::new().red().bold(),
        TxStatus::FailedInProgress => Style::new().yellow(),
        TxStatus::Unknown => Style::new().dim(),
        _ => Style::new().cyan(),
    }
}

/// Formata uma idade em milissegundos de forma compacta (`850ms`, `12s`,
/// `3m04s`, `5h12m`).
pub fn format_age(age_ms: i64) -> String {
    let age_ms = age_ms.max(0);
    let secs = age_ms / 1000;
    match secs {
        0 => format!("{age_ms}ms"),
        1..60 => format!("{secs}s"),
        60..3600 => format!("{}m{:02}s", secs / 60, secs % 60),
        _ => format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60),
    }
}

/// Imprime uma linha por transação.
pub fn print_summaries(summaries: &[TxSummary]) {
    if summaries.is_empty() {
        println!("{}", Style::new().dim().apply_to("no transactions"));
        return;
    }
    let header = Style::new().bold();
    println!(
        "{}",
        header.apply_to(format!(
            "{:<42} {:<18} {:<20} {:>5} {:>8}",
            "ID", "STATUS", "OPERATION", "DEPTH", "AGE"
        ))
    );
    for summary in summaries {
        println!(
            "{:<42} {:<18} {:<20} {:>5} {:>8}",
            summary.id.to_string(),
            status_style(summary.status).apply_to(format!("{:<18}", summary.status)),
            summary.op_name.as_deref().unwrap_or("-"),
            summary.stack_depth,
            format_age(summary.age_ms),
        );
    }
}

/// Imprime os detalhes de uma transação, incluindo falhas de desfazer que
/// exigem correção manual.
pub fn print_summary(summary: &TxSummary) {
    let label = Style::new().bold();
    let red = Style::new().red();
    println!("{} {}", label.apply_to("id:        "), summary.id);
    println!(
        "{} {}",
        label.apply_to("status:    "),
        status_style(summary.status).apply_to(summary.status)
    );
    println!(
        "{} {}",
        label.apply_to("operation: "),
        summary.op_name.as_deref().unwrap_or("-")
    );
    println!(
        "{} {} (depth {})",
        label.apply_to("top step:  "),
        summary.top_step.as_deref().unwrap_or("-"),
        summary.stack_depth
    );
    println!(
        "{} {}",
        label.apply_to("reserved:  "),
        summary.reserved_by.as_deref().unwrap_or("-")
    );
    println!("{} {}", label.apply_to("age:       "), format_age(summary.age_ms));
    for entry in &summary.locks {
        println!(
            "{} {} {} (seq {})",
            label.apply_to("lock:      "),
            entry.lock_type,
            entry.resource,
            entry.seq
        );
    }
    if let Some(failure) = &summary.failure {
        println!("{} {}", label.apply_to("failure:   "), red.apply_to(failure));
    }
    for undo in &summary.undo_failures {
        println!(
            "  {} undo of {} failed at {}: {}",
            red.apply_to("✗"),
            undo.step,
            undo.at.to_rfc3339(),
            undo.error
        );
    }
}

/// Imprime a tabela de locks; entradas ainda na fila aparecem em amarelo.
pub fn print_lock_table(table: &[LockState]) {
    if table.is_empty() {
        println!("{}", Style::new().dim().apply_to("no locks held or queued"));
        return;
    }
    let green = Style::new().green();
    let yellow = Style::new().yellow();
    for state in table {
        let (style, mark) = if state.granted {
            (&green, "held  ")
        } else {
            (&yellow, "queued")
        };
        println!(
            "{:<24} {} {:<5} {} (seq {})",
            state.resource.as_str(),
            style.apply_to(mark),
            state.lock_type,
            state.holder,
            state.seq
        );
    }
}

/// Indicador visual enquanto se aguarda o término de uma transação.
pub struct WaitProgress {
    // Spinner do indicatif.
    pb: ProgressBar,
}

impl WaitProgress {
    /// Inicia o spinner para a transação `id`.
    pub fn start(id: FateId) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg} [{elapsed}]")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(format!("waiting for {id}"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        Self { pb }
    }

    /// Atualiza a mensagem com o status atual.
    pub fn update(&self, id: FateId, status: TxStatus) {
        self.pb.set_message(format!("{id}: {status}"));
    }

    /// Finaliza o spinner e exibe o resultado final.
    pub fn finish(&self, id: FateId, status: TxStatus) {
        self.pb.finish_and_clear();
        let mark = match status {
            TxStatus::Successful => "✓",
            TxStatus::Failed => "✗",
            _ => "?",
        };
        let style = status_style(status);
        println!("  {} {id} {}", style.apply_to(mark), style.apply_to(status));
    }
}
