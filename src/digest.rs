//! Plain-text status digest for the assistant collaborator.
//!
//! Compact, line-oriented, stable ordering. The assistant only ever sees this
//! text, never the live structures.

use std::fmt::Write;

use crate::monitor::ModelMetrics;
use crate::types::{BatchStatus, CppParameter, TwinSnapshot};

/// Render a digest of one snapshot plus current model metrics.
pub fn render(snapshot: &TwinSnapshot, metrics: &[ModelMetrics], open_triggers: usize) -> String {
    let mut out = String::new();
    // Writing to a String cannot fail
    let _ = write_digest(&mut out, snapshot, metrics, open_triggers);
    out
}

fn write_digest(
    out: &mut String,
    snapshot: &TwinSnapshot,
    metrics: &[ModelMetrics],
    open_triggers: usize,
) -> std::fmt::Result {
    let warnings = snapshot
        .batches
        .iter()
        .filter(|b| b.status == BatchStatus::Warning)
        .count();
    writeln!(
        out,
        "Twin status at {} (tick {}): {} batches ({} warning), {} open deviation triggers",
        snapshot.timestamp.format("%Y-%m-%d %H:%M UTC"),
        snapshot.tick,
        snapshot.batches.len(),
        warnings,
        open_triggers
    )?;

    writeln!(out, "Batches:")?;
    for batch in &snapshot.batches {
        let out_of_spec: Vec<&str> = CppParameter::ALL
            .iter()
            .filter(|p| !batch.in_spec(**p))
            .map(|p| p.label())
            .collect();
        let spec_note = if out_of_spec.is_empty() {
            "all CPPs in spec".to_string()
        } else {
            format!("OUT OF SPEC: {}", out_of_spec.join(", "))
        };
        writeln!(
            out,
            "- {} {} [{}] {:.1}% {}, {}",
            batch.id,
            batch.product.product_code,
            batch.status,
            batch.progress,
            batch.stage,
            spec_note
        )?;
    }

    writeln!(out, "Equipment:")?;
    for unit in &snapshot.equipment_telemetry {
        writeln!(
            out,
            "- {} vib {:.2} mm/s, temp var {:.3}, uptime {:.0} h{}",
            unit.id,
            unit.vibration_rms,
            unit.temperature_variance,
            unit.uptime_hours,
            if unit.alert_active { ", ALERT" } else { "" }
        )?;
    }

    if !snapshot.recently_completed.is_empty() {
        writeln!(out, "Recently completed:")?;
        for done in snapshot.recently_completed.iter().rev().take(5) {
            writeln!(
                out,
                "- {} {} finished {} ({})",
                done.id,
                done.product_code,
                done.completed_at.format("%Y-%m-%d %H:%M"),
                done.final_status
            )?;
        }
    }

    if !metrics.is_empty() {
        writeln!(out, "Models:")?;
        for m in metrics {
            let accuracy = m
                .accuracy
                .map_or_else(|| "n/a".to_string(), |a| format!("{a:.3}"));
            writeln!(
                out,
                "- {} n={} acc={} brier={:.3} ece={:.3} auroc={:.3}",
                m.model_id, m.n, accuracy, m.brier, m.ece, m.auroc
            )?;
        }
    }

    Ok(())
}
