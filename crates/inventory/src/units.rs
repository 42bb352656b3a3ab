//! Volume-unit normalization to US beer barrels (bbl).

/// Unit → how many of that unit make one barrel.
///
/// Lookup is case-insensitive on the trimmed unit. Units missing from the
/// table have no barrel projection.
pub const UNITS_PER_BBL: &[(&str, f64)] = &[
    ("bbl", 1.0),
    ("barrel", 1.0),
    ("barrels", 1.0),
    ("gal", 31.0),
    ("gallon", 31.0),
    ("gallons", 31.0),
    ("l", 117.347_765),
    ("liter", 117.347_765),
    ("liters", 117.347_765),
    ("litre", 117.347_765),
    ("litres", 117.347_765),
    ("hl", 1.173_477_65),
    ("ml", 117_347.765),
    ("oz", 3_968.0),
];

/// Units of `unit` per barrel, if the unit is known.
pub fn units_per_bbl(unit: &str) -> Option<f64> {
    let unit = unit.trim();
    UNITS_PER_BBL
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(unit))
        .map(|(_, factor)| *factor)
}

/// Project `amount` of `unit` onto barrels; `None` for unknown units.
pub fn to_bbl(amount: i64, unit: &str) -> Option<f64> {
    units_per_bbl(unit).map(|per_bbl| amount as f64 / per_bbl)
}
