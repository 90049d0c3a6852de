//! Twin state store
//!
//! `TwinState` is the owned aggregate of every batch and equipment unit in one
//! simulation instance. Only the simulation mutates it; everyone else gets a
//! [`TwinSnapshot`].

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use std::collections::VecDeque;

use super::stochastic::standard_normal;
use crate::config::{defaults, EquipmentConfig, TwinConfig};
use crate::types::{
    BatchState, BatchStatus, CompletedBatch, CppBoundSet, CppBounds, CppParameter, CppReading,
    CppSet, EquipmentClass, EquipmentTelemetryState, ProductTemplate, TimelineEntry, TwinSnapshot,
};

/// Spread of a freshly started batch around target, as a fraction of half-range.
const RESET_NOISE_FRACTION: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct TwinState {
    /// Simulated clock, advanced by `dt` every tick.
    pub clock: DateTime<Utc>,
    pub tick: u64,
    pub batches: Vec<BatchState>,
    pub equipment: Vec<EquipmentTelemetryState>,
    pub completed: VecDeque<CompletedBatch>,
    completed_capacity: usize,
    batch_seq: u64,
}

impl TwinState {
    /// Empty state starting at `clock`.
    pub fn new(clock: DateTime<Utc>, completed_capacity: usize) -> Self {
        Self {
            clock,
            tick: 0,
            batches: Vec::new(),
            equipment: Vec::new(),
            completed: VecDeque::with_capacity(completed_capacity),
            completed_capacity,
            batch_seq: 0,
        }
    }

    /// Demonstration plant: three products in flight across six equipment units.
    pub fn seeded<R: Rng + ?Sized>(config: &TwinConfig, clock: DateTime<Utc>, rng: &mut R) -> Self {
        let mut state = Self::new(clock, config.simulation.completed_history);

        for unit in seed_equipment(&config.equipment) {
            let mut unit = unit;
            unit.uptime_hours = rng.gen_range(100.0..2_000.0);
            state.equipment.push(unit);
        }

        for (product, equipment_ids) in seed_products() {
            let progress = rng.gen_range(0.0..60.0);
            let hours_in = rng.gen_range(1.0..48.0);
            let started = clock - Duration::minutes((hours_in * 60.0) as i64);
            let batch = state.spawn_batch(product, equipment_ids, started, progress, rng);
            state.batches.push(batch);
        }

        state
    }

    /// Build a fresh batch: new id, parameters at target plus noise, one open
    /// timeline entry.
    pub fn spawn_batch<R: Rng + ?Sized>(
        &mut self,
        product: ProductTemplate,
        equipment_ids: Vec<String>,
        started_at: DateTime<Utc>,
        progress: f64,
        rng: &mut R,
    ) -> BatchState {
        self.batch_seq += 1;
        let id = format!(
            "{}-{}-{}",
            defaults::BATCH_ID_PREFIX,
            self.clock.timestamp_millis(),
            self.batch_seq
        );

        let mut parameters = product.targets.clone();
        for parameter in CppParameter::ALL {
            let half = product.bounds.get(parameter).half_range();
            let reading = parameters.get_mut(parameter);
            reading.current = reading.target + RESET_NOISE_FRACTION * half * standard_normal(rng);
        }

        let stage = product.stage_for(progress).to_string();
        BatchState {
            id,
            bounds: product.bounds,
            timeline: vec![TimelineEntry::open(&stage, started_at)],
            stage,
            product,
            progress,
            status: BatchStatus::Running,
            started_at,
            equipment_ids,
            parameters,
            warning_ticks_remaining: 0,
        }
    }

    /// Record a completion, evicting the oldest summary past capacity.
    pub fn record_completion(&mut self, summary: CompletedBatch) {
        if self.completed_capacity == 0 {
            return;
        }
        if self.completed.len() >= self.completed_capacity {
            self.completed.pop_front();
        }
        self.completed.push_back(summary);
    }

    /// Deep copy for subscribers.
    pub fn snapshot(&self) -> TwinSnapshot {
        TwinSnapshot {
            timestamp: self.clock,
            tick: self.tick,
            batches: self.batches.clone(),
            equipment_telemetry: self.equipment.clone(),
            recently_completed: self.completed.iter().cloned().collect(),
        }
    }
}

// ============================================================================
// Seed data
// ============================================================================

fn reading(target: f64, unit: &str) -> CppReading {
    CppReading {
        current: target,
        target,
        unit: unit.to_string(),
    }
}

fn bounds(min: f64, max: f64) -> CppBounds {
    CppBounds { min, max }
}

fn stages(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| (*s).to_string()).collect()
}

/// Product recipes with the equipment each batch runs on.
pub fn seed_products() -> Vec<(ProductTemplate, Vec<String>)> {
    vec![
        (
            ProductTemplate {
                product_code: "API-101".to_string(),
                product_name: "Amoxicillin API Synthesis".to_string(),
                stages: stages(&["Charging", "Reaction", "Quench", "Workup"]),
                targets: CppSet {
                    temperature: reading(65.0, "degC"),
                    pressure: reading(2.0, "bar"),
                    ph: reading(7.0, "pH"),
                    volume: reading(1_000.0, "L"),
                },
                bounds: CppBoundSet {
                    temperature: bounds(60.0, 70.0),
                    pressure: bounds(1.5, 2.5),
                    ph: bounds(6.5, 7.5),
                    volume: bounds(950.0, 1_050.0),
                },
            },
            vec!["RX-101".to_string()],
        ),
        (
            ProductTemplate {
                product_code: "CRY-205".to_string(),
                product_name: "Ibuprofen Crystallization".to_string(),
                stages: stages(&["Dissolution", "Cooling", "Crystallization", "Filtration"]),
                targets: CppSet {
                    temperature: reading(25.0, "degC"),
                    pressure: reading(1.0, "bar"),
                    ph: reading(6.0, "pH"),
                    volume: reading(800.0, "L"),
                },
                bounds: CppBoundSet {
                    temperature: bounds(20.0, 30.0),
                    pressure: bounds(0.8, 1.2),
                    ph: bounds(5.5, 6.5),
                    volume: bounds(760.0, 840.0),
                },
            },
            vec!["CR-201".to_string(), "FL-202".to_string()],
        ),
        (
            ProductTemplate {
                product_code: "FRM-310".to_string(),
                product_name: "Metformin Granulation".to_string(),
                stages: stages(&["Dispensing", "Granulation", "Drying", "Compression"]),
                targets: CppSet {
                    temperature: reading(45.0, "degC"),
                    pressure: reading(1.2, "bar"),
                    ph: reading(6.8, "pH"),
                    volume: reading(500.0, "L"),
                },
                bounds: CppBoundSet {
                    temperature: bounds(40.0, 50.0),
                    pressure: bounds(1.0, 1.4),
                    ph: bounds(6.3, 7.3),
                    volume: bounds(475.0, 525.0),
                },
            },
            vec!["GR-301".to_string(), "DR-302".to_string(), "TP-303".to_string()],
        ),
    ]
}

/// Equipment units at their class baselines.
pub fn seed_equipment(config: &EquipmentConfig) -> Vec<EquipmentTelemetryState> {
    [
        ("RX-101", EquipmentClass::Reactor),
        ("CR-201", EquipmentClass::Crystallization),
        ("FL-202", EquipmentClass::Filtration),
        ("GR-301", EquipmentClass::Granulator),
        ("DR-302", EquipmentClass::Dryer),
        ("TP-303", EquipmentClass::TabletPress),
    ]
    .into_iter()
    .map(|(id, class)| {
        let (rms, variance) = class_baseline(config, class);
        EquipmentTelemetryState {
            id: id.to_string(),
            class,
            vibration_rms: rms,
            alert_active: false,
            alert_ticks_remaining: 0,
            temperature_variance: variance,
            uptime_hours: 0.0,
        }
    })
    .collect()
}

/// (RMS, temperature variance) baseline for an equipment class.
pub fn class_baseline(config: &EquipmentConfig, class: EquipmentClass) -> (f64, f64) {
    if class.is_high_baseline() {
        (config.high_rms_baseline, config.high_variance_baseline)
    } else {
        (config.standard_rms_baseline, config.standard_variance_baseline)
    }
}
