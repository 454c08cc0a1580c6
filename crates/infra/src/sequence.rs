//! Document number generation.
//!
//! Counters live in the store and are bumped with a single atomic
//! upsert-increment that commits on its own. A number handed out to a
//! document that is never written stays consumed: gaps are expected, and
//! `audit_gaps` measures them against the configured tolerance.

use chrono::{DateTime, Utc};
use tracing::{debug, error, instrument, warn};

use stockflow_core::{BusinessId, LocationId};
use stockflow_inventory::{DocumentKind, DocumentNumber, GapReport, SequenceScope, find_gaps};

use crate::engine::InventoryEngine;
use crate::error::EngineResult;
use crate::store::InventoryStore;

pub struct SequenceGenerator<'a, S> {
    engine: &'a InventoryEngine<S>,
}

impl<'a, S: InventoryStore> SequenceGenerator<'a, S> {
    pub(crate) fn new(engine: &'a InventoryEngine<S>) -> Self {
        Self { engine }
    }

    /// Next counter for `scope`, starting at 1.
    #[instrument(
        skip(self),
        fields(
            business_id = %scope.business_id,
            location_id = %scope.location_id,
            date = %scope.date
        ),
        err
    )]
    pub fn next(&self, scope: SequenceScope) -> EngineResult<u64> {
        let counter = self
            .engine
            .config
            .retry
            .run("sequence.next", || Ok(self.engine.store.next_sequence(scope)?))?;
        debug!(counter, "sequence number issued");
        Ok(counter)
    }

    /// Scope for `at` as seen on the location's local calendar.
    pub fn scope_for(
        &self,
        business_id: BusinessId,
        location_id: LocationId,
        at: DateTime<Utc>,
    ) -> SequenceScope {
        SequenceScope::at(
            business_id,
            location_id,
            at,
            self.engine.config.sequences.offset_for(location_id),
        )
    }

    pub fn next_for(
        &self,
        business_id: BusinessId,
        location_id: LocationId,
        at: DateTime<Utc>,
    ) -> EngineResult<u64> {
        self.next(self.scope_for(business_id, location_id, at))
    }

    /// Formatted number such as `TRF-MAIN-20250301-0007`.
    pub fn next_document_number(
        &self,
        kind: DocumentKind,
        business_id: BusinessId,
        location_id: LocationId,
        at: DateTime<Utc>,
    ) -> EngineResult<DocumentNumber> {
        let scope = self.scope_for(business_id, location_id, at);
        let code = self.engine.config.sequences.location_code(location_id);
        let counter = self.next(scope)?;
        Ok(DocumentNumber::new(kind, &code, scope.date, counter)?)
    }

    pub fn current(&self, scope: SequenceScope) -> EngineResult<u64> {
        Ok(self.engine.store.current_sequence(scope)?)
    }

    /// Compare the numbers actually found on documents with what the counter
    /// handed out.
    #[instrument(
        skip(self, used),
        fields(
            business_id = %scope.business_id,
            location_id = %scope.location_id,
            date = %scope.date
        ),
        err
    )]
    pub fn audit_gaps(&self, scope: SequenceScope, used: &[u64]) -> EngineResult<GapReport> {
        let issued_through = self.current(scope)?;
        let report = find_gaps(
            scope,
            issued_through,
            used,
            self.engine.config.sequences.max_tolerated_gap,
        );

        if !report.duplicates.is_empty() || !report.beyond_counter.is_empty() {
            error!(
                duplicates = ?report.duplicates,
                beyond_counter = ?report.beyond_counter,
                "document numbers reused or never issued"
            );
        }
        if report.exceeds_threshold {
            warn!(
                issued_through,
                missing = report.missing.len(),
                largest_run = report.largest_run,
                max_tolerated_gap = report.max_tolerated_gap,
                "sequence gaps above tolerance"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, SequenceConfig};
    use crate::test_support::{engine, engine_with};
    use chrono::TimeZone;
    use std::collections::HashSet;

    fn scope() -> SequenceScope {
        SequenceScope::new(BusinessId::new(), LocationId::new(), Utc::now().date_naive())
    }

    #[test]
    fn concurrent_callers_get_distinct_increasing_numbers() {
        let engine = engine();
        let scope = scope();

        let per_thread: Vec<Vec<u64>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        (0..25)
                            .map(|_| engine.sequences().next(scope).unwrap())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for seen in &per_thread {
            assert!(seen.windows(2).all(|w| w[0] < w[1]));
        }
        let all: HashSet<u64> = per_thread.into_iter().flatten().collect();
        assert_eq!(all.len(), 200);
        assert_eq!(engine.sequences().current(scope).unwrap(), 200);
    }

    #[test]
    fn scopes_follow_the_local_calendar_day() {
        let location = LocationId::new();
        let engine = engine_with(EngineConfig::default().with_location(location, "east", 9 * 60));
        let business = BusinessId::new();

        // 20:00 UTC on Mar 1 is already Mar 2 at UTC+9.
        let late = Utc.with_ymd_and_hms(2025, 3, 1, 20, 0, 0).unwrap();
        let number = engine
            .sequences()
            .next_document_number(DocumentKind::Transfer, business, location, late)
            .unwrap();
        assert_eq!(number.to_string(), "TRF-EAST-20250302-0001");

        let again = engine
            .sequences()
            .next_document_number(DocumentKind::Transfer, business, location, late)
            .unwrap();
        assert_eq!(again.counter, 2);

        let other_business = engine
            .sequences()
            .next_for(BusinessId::new(), location, late)
            .unwrap();
        assert_eq!(other_business, 1);
    }

    #[test]
    fn gap_audit_flags_excess_missing_numbers() {
        let engine = engine_with(EngineConfig::default().with_sequences(SequenceConfig {
            max_tolerated_gap: 2,
            ..SequenceConfig::default()
        }));
        let scope = scope();
        for _ in 0..6 {
            engine.sequences().next(scope).unwrap();
        }

        let tolerable = engine.sequences().audit_gaps(scope, &[1, 2, 3, 5, 6]).unwrap();
        assert_eq!(tolerable.missing, vec![4]);
        assert!(!tolerable.exceeds_threshold);
        assert!(tolerable.is_sound());

        let excessive = engine.sequences().audit_gaps(scope, &[1, 6]).unwrap();
        assert_eq!(excessive.missing, vec![2, 3, 4, 5]);
        assert!(excessive.exceeds_threshold);

        let broken = engine.sequences().audit_gaps(scope, &[1, 1, 7]).unwrap();
        assert!(!broken.is_sound());
    }
}
