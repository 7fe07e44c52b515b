use ledgerforge_common::config::GateConfig;
use ledgerforge_common::ingest::{ConfidenceScores, FieldError, GateDecision, ItemStatus, Severity};
use ledgerforge_ingestion::gate::{validation_confidence, ConfidenceGate};
use proptest::prelude::*;

fn unit() -> impl Strategy<Value = f64> {
    0.0f64..=1.0
}

fn scores() -> impl Strategy<Value = ConfidenceScores> {
    (unit(), unit(), unit(), unit()).prop_map(|(parser, classification, mapping, validation)| {
        ConfidenceScores {
            parser,
            classification,
            mapping,
            validation,
        }
    })
}

fn severity() -> impl Strategy<Value = Severity> {
    prop_oneof![
        Just(Severity::Warning),
        Just(Severity::Error),
        Just(Severity::Critical),
    ]
}

fn errors() -> impl Strategy<Value = Vec<FieldError>> {
    proptest::collection::vec(severity(), 0..6).prop_map(|severities| {
        severities
            .into_iter()
            .map(|s| FieldError::new(Some("total_amount"), "CHECK", "generated", s))
            .collect()
    })
}

proptest! {
    #[test]
    fn overall_stays_in_unit_range(s in scores()) {
        let gate = ConfidenceGate::from_config(&GateConfig::default());
        let overall = gate.overall(&s);
        prop_assert!((0.0..=1.0).contains(&overall));
    }

    #[test]
    fn below_threshold_never_auto_approves(s in scores()) {
        let config = GateConfig::default();
        let gate = ConfidenceGate::from_config(&config);
        let outcome = gate.evaluate(s);
        if outcome.overall < config.auto_approve_threshold {
            prop_assert_ne!(outcome.decision, GateDecision::AutoApprove);
        }
        if outcome.overall < config.review_threshold {
            prop_assert_eq!(outcome.decision, GateDecision::BlockPromotion);
        }
    }

    #[test]
    fn critical_errors_always_reject(s in scores(), mut errs in errors()) {
        let gate = ConfidenceGate::from_config(&GateConfig::default());
        errs.push(FieldError::new(None, "NO_AMOUNTS", "generated", Severity::Critical));
        let (_, status) = gate.decide_item(s, &errs);
        prop_assert_eq!(status, ItemStatus::Rejected);
    }

    #[test]
    fn errors_never_auto_validate(s in scores(), errs in errors()) {
        let gate = ConfidenceGate::from_config(&GateConfig::default());
        let has_error = errs.iter().any(|e| e.severity >= Severity::Error);
        let (outcome, status) = gate.decide_item(s, &errs);
        if has_error {
            prop_assert_ne!(status, ItemStatus::Validated);
            prop_assert_ne!(outcome.decision, GateDecision::AutoApprove);
        }
    }

    #[test]
    fn more_errors_lower_validation_confidence(errs in errors(), extra in severity()) {
        let before = validation_confidence(&errs);
        let mut more = errs.clone();
        more.push(FieldError::new(None, "CHECK", "generated", extra));
        let after = validation_confidence(&more);
        prop_assert!(after <= before);
        prop_assert!((0.0..=1.0).contains(&after));
    }
}
