//! Resource governance: admission control and pressure escalation.
//!
//! Two thresholds per signal:
//!
//! | Signal          | Pressure (warning)               | Admission ceiling     |
//! |-----------------|----------------------------------|-----------------------|
//! | live sessions   | > `pressure_session_ratio × max` | ≥ `max_sessions`      |
//! | memory in use   | > `memory_warning`               | > `memory_ceiling`    |
//!
//! Under pressure, [`ResourceGovernor::relieve_pressure`] sweeps idle
//! sessions with the shorter `pressure_idle_timeout`; with memory above the
//! ceiling it escalates to the emergency `emergency_idle_timeout`.  Limit
//! violations are reported as [`SessionError::ResourceExhausted`], never as
//! panics.

use std::time::Duration;

use log::{info, warn};

use crate::config::RelayConfig;
use crate::session::{SessionError, SessionId, SessionRegistry};
use crate::util;

/// Source of the memory-pressure signal.
pub trait MemoryProbe: Send + Sync {
    /// Fraction of memory in use, `0.0..=1.0`.  `None` when unknown.
    fn usage_ratio(&self) -> Option<f64>;
}

/// Reads `MemTotal` / `MemAvailable` from `/proc/meminfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcMemory;

impl MemoryProbe for ProcMemory {
    fn usage_ratio(&self) -> Option<f64> {
        util::read_meminfo().map(|m| m.usage_ratio())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GovernorLimits {
    pub max_sessions:           usize,
    pub pressure_session_ratio: f64,
    pub memory_warning:         f64,
    pub memory_ceiling:         f64,
    pub pressure_idle_timeout:  Duration,
    pub emergency_idle_timeout: Duration,
}

impl From<&RelayConfig> for GovernorLimits {
    fn from(cfg: &RelayConfig) -> Self {
        GovernorLimits {
            max_sessions:           cfg.max_sessions,
            pressure_session_ratio: cfg.pressure_session_ratio,
            memory_warning:         cfg.memory_warning,
            memory_ceiling:         cfg.memory_ceiling,
            pressure_idle_timeout:  Duration::from_secs(cfg.pressure_idle_timeout),
            emergency_idle_timeout: Duration::from_secs(cfg.emergency_idle_timeout),
        }
    }
}

pub struct ResourceGovernor {
    registry: SessionRegistry,
    limits:   GovernorLimits,
    memory:   Box<dyn MemoryProbe>,
}

impl ResourceGovernor {
    pub fn new(registry: SessionRegistry, limits: GovernorLimits, memory: Box<dyn MemoryProbe>) -> Self {
        ResourceGovernor { registry, limits, memory }
    }

    pub fn limits(&self) -> &GovernorLimits { &self.limits }

    /// Admission check for a new connection.
    pub fn admit(&self) -> Result<(), SessionError> {
        let count = self.registry.count();
        if count >= self.limits.max_sessions {
            return Err(SessionError::ResourceExhausted(format!(
                "session limit reached ({count}/{})",
                self.limits.max_sessions
            )));
        }
        if let Some(ratio) = self.memory.usage_ratio() {
            if ratio > self.limits.memory_ceiling {
                return Err(SessionError::ResourceExhausted(format!(
                    "memory usage {:.1}% above ceiling {:.1}%",
                    ratio * 100.0,
                    self.limits.memory_ceiling * 100.0
                )));
            }
        }
        Ok(())
    }

    /// [`admit`](Self::admit) as a predicate.  Rejections are logged by the
    /// caller that acts on them.
    pub fn can_admit_new_session(&self) -> bool {
        self.admit().is_ok()
    }

    pub fn is_under_pressure(&self) -> bool {
        let sessions_high = self.registry.count() as f64
            > self.limits.pressure_session_ratio * self.limits.max_sessions as f64;
        let memory_high = self
            .memory
            .usage_ratio()
            .is_some_and(|r| r > self.limits.memory_warning);
        sessions_high || memory_high
    }

    /// Escalated sweep: the pressure threshold normally, the emergency one
    /// while memory is above the admission ceiling.
    pub fn relieve_pressure(&self) -> Vec<SessionId> {
        let before = self.registry.count();
        let threshold = self.relief_threshold();
        let removed = self.registry.sweep_idle(threshold);
        if !removed.is_empty() {
            info!(
                "pressure sweep (>{}s) removed {} idle session(s) ({before} → {})",
                threshold.as_secs(),
                removed.len(),
                self.registry.count()
            );
        }
        removed
    }

    /// Idle threshold [`relieve_pressure`](Self::relieve_pressure) sweeps with.
    pub fn relief_threshold(&self) -> Duration {
        let critical = self
            .memory
            .usage_ratio()
            .is_some_and(|r| r > self.limits.memory_ceiling);
        if critical {
            warn!("memory above {:.0}%: emergency cleanup", self.limits.memory_ceiling * 100.0);
            self.limits.emergency_idle_timeout
        } else {
            self.limits.pressure_idle_timeout
        }
    }

    /// One-line utilisation summary for logs.
    pub fn utilization_summary(&self) -> String {
        let memory = match self.memory.usage_ratio() {
            Some(r) => format!("{:.1}%", r * 100.0),
            None    => "n/a".to_string(),
        };
        format!(
            "Memory: {memory}, Sessions: {}/{}, Under pressure: {}",
            self.registry.count(),
            self.limits.max_sessions,
            self.is_under_pressure()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    /// Probe whose reading can be changed from the test.
    #[derive(Clone, Default)]
    struct FixedMemory(Arc<AtomicU64>);

    impl FixedMemory {
        fn set(&self, ratio: f64) { self.0.store(ratio.to_bits(), Ordering::SeqCst); }
    }

    impl MemoryProbe for FixedMemory {
        fn usage_ratio(&self) -> Option<f64> { Some(f64::from_bits(self.0.load(Ordering::SeqCst))) }
    }

    fn limits() -> GovernorLimits {
        GovernorLimits {
            max_sessions:           10,
            pressure_session_ratio: 0.8,
            memory_warning:         0.75,
            memory_ceiling:         0.90,
            pressure_idle_timeout:  Duration::from_secs(45),
            emergency_idle_timeout: Duration::from_secs(30),
        }
    }

    fn governor() -> (SessionRegistry, FixedMemory, ResourceGovernor) {
        let reg = SessionRegistry::new();
        let mem = FixedMemory::default();
        let gov = ResourceGovernor::new(reg.clone(), limits(), Box::new(mem.clone()));
        (reg, mem, gov)
    }

    #[test]
    fn admission_stops_at_session_limit() {
        let (reg, _mem, gov) = governor();
        for n in 0..9 {
            reg.create(SessionId::new(format!("s{n}")));
        }
        assert!(gov.can_admit_new_session());
        reg.create(SessionId::new("s9"));
        assert!(!gov.can_admit_new_session());
        assert!(matches!(gov.admit(), Err(SessionError::ResourceExhausted(_))));
    }

    #[test]
    fn pressure_precedes_rejection() {
        let (reg, mem, gov) = governor();
        mem.set(0.80);
        assert!(gov.is_under_pressure());
        assert!(gov.can_admit_new_session());

        mem.set(0.95);
        assert!(!gov.can_admit_new_session());

        mem.set(0.10);
        assert!(!gov.is_under_pressure());
        for n in 0..9 {
            reg.create(SessionId::new(format!("s{n}")));
        }
        // 9 > 0.8 × 10, still below the hard limit.
        assert!(gov.is_under_pressure());
        assert!(gov.can_admit_new_session());
    }

    #[test]
    fn unknown_memory_does_not_block() {
        struct Blind;
        impl MemoryProbe for Blind {
            fn usage_ratio(&self) -> Option<f64> { None }
        }
        let gov = ResourceGovernor::new(SessionRegistry::new(), limits(), Box::new(Blind));
        assert!(gov.can_admit_new_session());
        assert!(!gov.is_under_pressure());
        assert!(gov.utilization_summary().contains("Memory: n/a"));
    }

    #[test]
    fn relief_uses_shorter_threshold() {
        let (reg, _mem, gov) = governor();
        // Relief sweeps against the real clock, so backdate activity instead.
        let past = Instant::now()
            .checked_sub(Duration::from_secs(60))
            .expect("monotonic clock older than a minute");
        reg.create(SessionId::new("idle")).append_at(&[1.0], past).unwrap();
        reg.create(SessionId::new("busy")).append(&[1.0]).unwrap();

        let removed = gov.relieve_pressure();
        assert_eq!(removed, vec![SessionId::new("idle")]);
        assert!(reg.contains("busy"));
    }

    #[test]
    fn critical_memory_escalates_to_emergency_threshold() {
        let (reg, mem, gov) = governor();
        let ago = |secs| Instant::now()
            .checked_sub(Duration::from_secs(secs))
            .expect("monotonic clock older than the backdate");
        reg.create(SessionId::new("idle40")).append_at(&[1.0], ago(40)).unwrap();
        reg.create(SessionId::new("idle10")).append_at(&[1.0], ago(10)).unwrap();

        mem.set(0.80);
        assert_eq!(gov.relief_threshold(), Duration::from_secs(45));
        assert!(gov.relieve_pressure().is_empty());

        mem.set(0.95);
        assert_eq!(gov.relief_threshold(), Duration::from_secs(30));
        assert_eq!(gov.relieve_pressure(), vec![SessionId::new("idle40")]);
        assert!(reg.contains("idle10"));
    }
}
