use crate::types::Amount;

/// Renders a smallest-unit amount as a decimal string with trailing zeros
/// trimmed, e.g. `1_500_000` at 6 decimals is `"1.5"`.
pub fn format_amount(amount: Amount, decimals: u8) -> String {
    let digits = amount.to_string();
    let decimals = usize::from(decimals);
    if decimals == 0 {
        return digits;
    }
    let padded = format!("{digits:0>width$}", width = decimals + 1);
    let (whole, fraction) = padded.split_at(padded.len() - decimals);
    let fraction = fraction.trim_end_matches('0');
    if fraction.is_empty() {
        whole.to_string()
    } else {
        format!("{whole}.{fraction}")
    }
}

/// Like [`format_amount`] with an asset ticker appended when known.
pub fn format_with_ticker(amount: Amount, decimals: u8, ticker: Option<&str>) -> String {
    match ticker {
        Some(ticker) => format!("{} {ticker}", format_amount(amount, decimals)),
        None => format_amount(amount, decimals),
    }
}
