//! Checksum primitives shared by the country packs

/// Parse an all-ASCII-digit string into its digit values.
pub(crate) fn digits(s: &str) -> Option<Vec<u32>> {
    s.chars().map(|c| c.to_digit(10)).collect()
}

/// Mod-10 check digit with "products above nine lose nine" coefficients.
pub(crate) fn mod10_coefficients(body: &[u32], coefficients: &[u32]) -> u32 {
    let sum: u32 = body
        .iter()
        .zip(coefficients)
        .map(|(&d, &c)| {
            let p = d * c;
            if p > 9 {
                p - 9
            } else {
                p
            }
        })
        .sum();
    (10 - sum % 10) % 10
}

/// Mod-11 check digit with explicit weights. `None` when the result is 10.
pub(crate) fn mod11_weighted(body: &[u32], weights: &[u32]) -> Option<u32> {
    let sum: u32 = body.iter().zip(weights).map(|(&d, &w)| d * w).sum();
    match sum % 11 {
        0 => Some(0),
        1 => None,
        r => Some(11 - r),
    }
}

/// Mod-11 check digit with weights 2..=7 cycling from the rightmost digit.
/// 11 maps to 0 and 10 maps to 1.
pub(crate) fn mod11_cyclic(body: &[u32]) -> u32 {
    let sum: u32 = body
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| d * (2 + (i as u32 % 6)))
        .sum();
    match 11 - sum % 11 {
        11 => 0,
        10 => 1,
        v => v,
    }
}
