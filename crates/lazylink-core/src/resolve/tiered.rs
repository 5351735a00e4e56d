//! Tiered reference resolver
//!
//! Translates guest functions at a cheap tier on first use, promotes them to
//! the optimized tier when the promotion policy says so, and only lets
//! optimized code into dispatch entries. Baseline code stays behind the
//! stubs, so every call through it comes back here and keeps counting.

use std::fmt;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::abi::GuestFunction;
use crate::config::TieringConfig;
use crate::dispatch::DispatchEntry;
use crate::{JitError, JitResult};

use super::ResolutionService;

/// Code-quality tier of a translation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tier {
    /// Fast to produce, slow to run
    Baseline,
    /// Fully optimized; eligible for dispatch entries
    Optimized,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Baseline => f.write_str("baseline"),
            Tier::Optimized => f.write_str("optimized"),
        }
    }
}

/// Translates guest code to host code at a given tier
pub trait GuestTranslator: Send + Sync {
    fn translate(&self, guest: u64, tier: Tier) -> JitResult<GuestFunction>;
}

/// Decides when a baseline translation is re-translated as optimized
pub trait PromotionPolicy: Send + Sync {
    /// `calls` counts resolutions of `guest`, including the current one
    fn should_promote(&self, guest: u64, calls: u64) -> bool;
}

/// Promote once a function has been resolved `threshold` times
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallCountPolicy {
    threshold: u64,
}

impl CallCountPolicy {
    #[must_use]
    pub const fn new(threshold: u64) -> Self {
        Self { threshold }
    }

    #[must_use]
    pub fn from_config(config: &TieringConfig) -> Self {
        Self::new(config.promotion_threshold)
    }

    #[must_use]
    pub const fn threshold(&self) -> u64 {
        self.threshold
    }
}

impl PromotionPolicy for CallCountPolicy {
    fn should_promote(&self, _guest: u64, calls: u64) -> bool {
        calls >= self.threshold
    }
}

/// Keep everything at the baseline tier
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverPromote;

impl PromotionPolicy for NeverPromote {
    fn should_promote(&self, _guest: u64, _calls: u64) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy)]
struct FunctionRecord {
    function: GuestFunction,
    tier: Tier,
    calls: u64,
}

/// Resolution Service backed by a [`GuestTranslator`]
pub struct TieredResolver<T, P> {
    translator: T,
    policy: P,
    functions: DashMap<u64, FunctionRecord>,
}

impl<T: GuestTranslator, P: PromotionPolicy> TieredResolver<T, P> {
    pub fn new(translator: T, policy: P) -> Self {
        Self {
            translator,
            policy,
            functions: DashMap::new(),
        }
    }

    pub fn translator(&self) -> &T {
        &self.translator
    }

    /// Tier of the current translation of `guest`
    pub fn tier_of(&self, guest: u64) -> Option<Tier> {
        self.functions.get(&guest).map(|record| record.tier)
    }

    /// How many times `guest` has been resolved
    pub fn call_count(&self, guest: u64) -> u64 {
        self.functions.get(&guest).map_or(0, |record| record.calls)
    }

    /// Number of translated guest functions
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Resolve `guest`, translating or promoting as needed
    pub fn resolve(&self, guest: u64) -> JitResult<(GuestFunction, Tier)> {
        let record = self.record_call(guest)?;
        if record.tier == Tier::Optimized || !self.policy.should_promote(guest, record.calls) {
            return Ok((record.function, record.tier));
        }

        // Translate outside the map lock; a racing thread may do the same and
        // the first promotion wins.
        let optimized = self.translator.translate(guest, Tier::Optimized)?;
        let mut record = self.functions.entry(guest).or_insert(record);
        if record.tier == Tier::Baseline {
            record.function = optimized;
            record.tier = Tier::Optimized;
            info!(
                guest = format_args!("{guest:#x}"),
                calls = record.calls,
                code = ?optimized,
                "promoted guest function"
            );
        }
        Ok((record.function, record.tier))
    }

    fn record_call(&self, guest: u64) -> JitResult<FunctionRecord> {
        if let Some(mut record) = self.functions.get_mut(&guest) {
            record.calls += 1;
            return Ok(*record);
        }

        let function = self.translator.translate(guest, Tier::Baseline)?;
        debug!(guest = format_args!("{guest:#x}"), code = ?function, "translated at baseline");

        let mut record = self.functions.entry(guest).or_insert(FunctionRecord {
            function,
            tier: Tier::Baseline,
            calls: 0,
        });
        record.calls += 1;
        Ok(*record)
    }
}

fn translation_failed(guest: u64, error: &JitError) -> ! {
    panic!("cannot resolve guest function {guest:#x}: {error}")
}

impl<T: GuestTranslator, P: PromotionPolicy> ResolutionService for TieredResolver<T, P> {
    fn resolve_direct(&self, token: u64) -> GuestFunction {
        match self.resolve(token) {
            Ok((function, _)) => function,
            Err(error) => translation_failed(token, &error),
        }
    }

    fn resolve_indirect(&self, token: u64, entry: &DispatchEntry) -> GuestFunction {
        match self.resolve(token) {
            Ok((function, Tier::Optimized)) => {
                if entry.host_address() != function.address() {
                    entry.publish(function);
                }
                function
            }
            Ok((function, Tier::Baseline)) => function,
            Err(error) => translation_failed(token, &error),
        }
    }
}
