// Instrument-aware number normalisation and venue code mapping.
// Precision is derived from the instrument's price/quantity increments.

use crate::engine::types::Instrument;

/// Increment assumed when the instrument does not publish one.
pub const DEFAULT_PRICE_INCREMENT: f64 = 0.01;

/// Rendered wherever a value cannot be shown.
pub const UNAVAILABLE: &str = "—";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Normaliser {
    pub price_precision: usize,
    pub quantity_precision: usize,
}

impl Normaliser {
    pub fn new(price_precision: usize, quantity_precision: usize) -> Self {
        Self { price_precision, quantity_precision }
    }

    /// Precision rules for `instrument`; no instrument means whole numbers.
    pub fn for_instrument(instrument: Option<&Instrument>) -> Self {
        match instrument {
            None => Self::default(),
            Some(ins) => Self {
                price_precision: decimals_of(ins.min_price_increment.unwrap_or(DEFAULT_PRICE_INCREMENT)),
                quantity_precision: decimals_of(ins.min_quantity_increment.unwrap_or(0.0)),
            },
        }
    }

    pub fn format_price(&self, price: f64) -> String {
        if !price.is_finite() {
            return UNAVAILABLE.to_string();
        }
        format!("{:.*}", self.price_precision, price)
    }

    pub fn format_quantity(&self, quantity: f64) -> String {
        if !quantity.is_finite() {
            return UNAVAILABLE.to_string();
        }
        format!("{:.*}", self.quantity_precision, quantity)
    }

    /// Parse user-entered price text (either decimal separator) and round it
    /// to the instrument precision. Unparseable input becomes zero.
    pub fn fix_price(&self, text: &str) -> String {
        let price = text.trim().replace(',', ".").parse::<f64>().ok().filter(|p| p.is_finite()).unwrap_or(0.0);
        format!("{:.*}", self.price_precision, price)
    }

    /// Bond price quoted in percent of nominal → absolute price.
    pub fn relative_bond_price_to_price(&self, relative: f64, nominal: f64) -> f64 {
        self.fix_price(&(relative * nominal / 100.0).to_string()).parse().unwrap_or(0.0)
    }
}

/// Absolute bond price → percent of nominal, two decimals.
pub fn bond_price_to_relative_bond_price(price: f64, nominal: f64) -> f64 {
    if nominal == 0.0 {
        return 0.0;
    }
    round_to(price * 100.0 / nominal, 2)
}

/// `ratio` rendered as a percentage with `decimals` fraction digits.
pub fn format_percentage(ratio: f64, decimals: usize) -> String {
    if !ratio.is_finite() {
        return UNAVAILABLE.to_string();
    }
    format!("{:.*}%", decimals, ratio * 100.0)
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Number of fraction digits in the shortest decimal form of `increment`.
pub fn decimals_of(increment: f64) -> usize {
    if !increment.is_finite() {
        return 0;
    }
    // f64 Display never uses exponent notation
    increment
        .abs()
        .to_string()
        .split_once('.')
        .map(|(_, frac)| frac.len())
        .unwrap_or(0)
}

/// Map a short venue/pool code to its market identifier code.
/// Unknown codes are returned unchanged.
pub fn normalise_venue(code: &str) -> &str {
    match code {
        "PA" | "P" => "ARCA",
        "DA" | "J" => "EDGA",
        "DX" | "K" => "EDGX",
        "SPBX" => "SPBX",
        "BT" | "Z" => "BZX",
        "MW" | "M" => "CHX",
        "A" => "AMEX",   // NYSE American
        "B" => "BX",     // Nasdaq OMX BX
        "C" => "NSX",
        "D" => "XADF",   // FINRA ADF
        "E" => "MIND",
        "H" => "HPE",    // MIAX Pearl
        "I" => "XISX",
        "L" => "LTE",    // LTSE
        "N" => "NYSE",
        "Q" => "XNAS",
        "S" => "XNCM",   // Nasdaq small cap
        "T" => "XNIM",
        "U" => "MMX",    // MEMX
        "V" => "IEX",
        "W" => "CBOE",
        "X" => "PHO",    // Nasdaq PHLX
        "Y" => "BYX",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instrument(increment: Option<f64>) -> Instrument {
        let mut ins = Instrument::placeholder("SBER");
        ins.min_price_increment = increment;
        ins.min_quantity_increment = Some(1.0);
        ins
    }

    #[test]
    fn test_precision_from_increment() {
        assert_eq!(decimals_of(0.01), 2);
        assert_eq!(decimals_of(0.0005), 4);
        assert_eq!(decimals_of(1.0), 0);
        assert_eq!(decimals_of(0.0000001), 7);

        let n = Normaliser::for_instrument(Some(&instrument(None)));
        assert_eq!(n.price_precision, 2);
        assert_eq!(n.quantity_precision, 0);
        assert_eq!(Normaliser::for_instrument(None).price_precision, 0);
    }

    #[test]
    fn test_fix_price() {
        let n = Normaliser::for_instrument(Some(&instrument(Some(0.01))));
        assert_eq!(n.fix_price("1,5"), "1.50");
        assert_eq!(n.fix_price("abc"), "0.00");
        assert_eq!(n.fix_price(" 101.499 "), "101.50");
    }

    #[test]
    fn test_bond_conversions() {
        let n = Normaliser::for_instrument(Some(&instrument(Some(0.01))));
        assert_eq!(n.relative_bond_price_to_price(98.5, 1000.0), 985.0);
        assert_eq!(bond_price_to_relative_bond_price(985.0, 1000.0), 98.5);
        assert_eq!(bond_price_to_relative_bond_price(985.0, 0.0), 0.0);
    }

    #[test]
    fn test_format_percentage() {
        assert_eq!(format_percentage(0.015, 2), "1.50%");
        assert_eq!(format_percentage(f64::INFINITY, 2), UNAVAILABLE);
    }

    #[test]
    fn test_normalise_venue() {
        assert_eq!(normalise_venue("Q"), "XNAS");
        assert_eq!(normalise_venue("PA"), "ARCA");
        assert_eq!(normalise_venue("MOEX"), "MOEX");
    }
}
