use ledgerforge_rules::{ecuador, spain, Ecuador, RuleCode, RulePack, Spain};
use proptest::prelude::*;

fn province() -> impl Strategy<Value = u32> {
    prop_oneof![1u32..=24, Just(30u32)]
}

fn digit_string(len: usize) -> impl Strategy<Value = String> {
    proptest::collection::vec(0u32..10, len)
        .prop_map(|d| d.into_iter().filter_map(|x| char::from_digit(x, 10)).collect())
}

fn cedula() -> impl Strategy<Value = String> {
    (province(), 0u32..6, digit_string(6)).prop_filter_map("cédula body", |(p, t, rest)| {
        ecuador::cedula_with_check(&format!("{:02}{}{}", p, t, rest))
    })
}

fn company_ruc() -> impl Strategy<Value = String> {
    (province(), digit_string(6)).prop_filter_map("company RUC with a check digit", |(p, rest)| {
        ecuador::ruc_company_with_check(&format!("{:02}9{}", p, rest))
    })
}

fn public_ruc() -> impl Strategy<Value = String> {
    (province(), digit_string(5)).prop_filter_map("public RUC with a check digit", |(p, rest)| {
        ecuador::ruc_public_with_check(&format!("{:02}6{}", p, rest))
    })
}

fn cif() -> impl Strategy<Value = String> {
    (
        prop::sample::select(vec!['A', 'B', 'C', 'G', 'J', 'N', 'P', 'Q', 'S', 'U', 'W']),
        0u32..10_000_000,
    )
        .prop_filter_map("entity letter", |(entity, body)| spain::cif_with_control(entity, body))
}

/// Replace the digit at `pos` with a different digit.
fn mutate(id: &str, pos: usize, delta: u32) -> String {
    id.chars()
        .enumerate()
        .map(|(i, c)| match (i == pos, c.to_digit(10)) {
            (true, Some(d)) => char::from_digit((d + delta) % 10, 10).unwrap(),
            _ => c,
        })
        .collect()
}

fn assert_single_checksum(errors: &[ledgerforge_rules::RuleError]) -> Result<(), TestCaseError> {
    prop_assert_eq!(errors.len(), 1, "errors: {:?}", errors);
    prop_assert_eq!(errors[0].code, RuleCode::Checksum);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn generated_ecuador_ids_are_valid(c in cedula(), r in company_ruc(), p in public_ruc()) {
        prop_assert!(Ecuador.validate_tax_id(&c).is_empty(), "{}", c);
        prop_assert!(Ecuador.validate_tax_id(&r).is_empty(), "{}", r);
        prop_assert!(Ecuador.validate_tax_id(&p).is_empty(), "{}", p);
    }

    #[test]
    fn generated_access_keys_are_valid(body in digit_string(48)) {
        let key = ecuador::access_key_with_check(&body).unwrap();
        prop_assert!(Ecuador.validate_access_key(&key).is_empty());
    }

    #[test]
    fn mutated_cedula_fails_checksum(c in cedula(), pos in 3usize..10, delta in 1u32..10) {
        assert_single_checksum(&Ecuador.validate_tax_id(&mutate(&c, pos, delta)))?;
    }

    #[test]
    fn mutated_company_ruc_fails_checksum(r in company_ruc(), pos in 3usize..10, delta in 1u32..10) {
        assert_single_checksum(&Ecuador.validate_tax_id(&mutate(&r, pos, delta)))?;
    }

    #[test]
    fn mutated_public_ruc_fails_checksum(r in public_ruc(), pos in 3usize..9, delta in 1u32..10) {
        assert_single_checksum(&Ecuador.validate_tax_id(&mutate(&r, pos, delta)))?;
    }

    #[test]
    fn generated_spanish_ids_are_valid(n in 0u32..100_000_000, m in 0u32..10_000_000, c in cif()) {
        let dni = spain::dni_with_letter(n);
        let nie = spain::nie_with_letter('Y', m).unwrap();
        prop_assert!(Spain.validate_tax_id(&dni).is_empty(), "{}", dni);
        prop_assert!(Spain.validate_tax_id(&nie).is_empty(), "{}", nie);
        prop_assert!(Spain.validate_tax_id(&c).is_empty(), "{}", c);
    }

    #[test]
    fn mutated_dni_fails_checksum(n in 0u32..100_000_000, pos in 0usize..8, delta in 1u32..10) {
        let dni = spain::dni_with_letter(n);
        assert_single_checksum(&Spain.validate_tax_id(&mutate(&dni, pos, delta)))?;
    }

    #[test]
    fn mutated_nie_fails_checksum(
        prefix in prop::sample::select(vec!['X', 'Y', 'Z']),
        m in 0u32..10_000_000,
        pos in 1usize..8,
        delta in 1u32..10,
    ) {
        let nie = spain::nie_with_letter(prefix, m).unwrap();
        assert_single_checksum(&Spain.validate_tax_id(&mutate(&nie, pos, delta)))?;
    }

    #[test]
    fn mutated_cif_fails_checksum(c in cif(), pos in 1usize..8, delta in 1u32..10) {
        assert_single_checksum(&Spain.validate_tax_id(&mutate(&c, pos, delta)))?;
    }
}
