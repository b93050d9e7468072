//! Segment grammar: one structural segment per line, `*`-separated elements,
//! `~` terminator.

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;

pub const ELEMENT_SEPARATOR: char = '*';
pub const SEGMENT_TERMINATOR: char = '~';

/// A single output segment: an identifier followed by positional elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    id: &'static str,
    elements: Vec<String>,
}

impl Segment {
    pub fn new(id: &'static str) -> Self {
        Self {
            id,
            elements: Vec::new(),
        }
    }

    /// Append one element, sanitized so it can never break the grammar.
    #[must_use]
    pub fn element(mut self, value: impl AsRef<str>) -> Self {
        self.elements.push(sanitize_element(value.as_ref()));
        self
    }

    /// Append an element only when the value is present; absent values still
    /// occupy their position as an empty element.
    #[must_use]
    pub fn optional(self, value: Option<&str>) -> Self {
        match value {
            Some(v) => self.element(v),
            None => self.element(""),
        }
    }

    pub fn id(&self) -> &'static str {
        self.id
    }

    /// Render the segment as one terminated line, trailing empty elements
    /// dropped.
    pub fn render(&self) -> String {
        let mut out = String::from(self.id);
        let last_populated = self
            .elements
            .iter()
            .rposition(|e| !e.is_empty())
            .map_or(0, |i| i + 1);
        for element in &self.elements[..last_populated] {
            out.push(ELEMENT_SEPARATOR);
            out.push_str(element);
        }
        out.push(SEGMENT_TERMINATOR);
        out
    }
}

/// Replace characters that would collide with the grammar's delimiters.
fn sanitize_element(value: &str) -> String {
    value
        .trim()
        .chars()
        .map(|c| {
            if c == ELEMENT_SEPARATOR || c == SEGMENT_TERMINATOR || c == '\n' || c == '\r' {
                ' '
            } else {
                c
            }
        })
        .collect()
}

/// Dollar amounts render without a currency symbol, trailing zeros stripped.
pub fn fmt_amount(amount: Decimal) -> String {
    let normalized = amount.round_dp(2).normalize();
    normalized.to_string()
}

/// Calendar dates render as CCYYMMDD.
pub fn fmt_date(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

/// Interchange timestamps render as (CCYYMMDD, HHMM).
pub fn fmt_timestamp(ts: NaiveDateTime) -> (String, String) {
    (
        ts.format("%Y%m%d").to_string(),
        ts.format("%H%M").to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    #[test]
    fn render_drops_trailing_empty_elements() {
        let seg = Segment::new("NM1")
            .element("QC")
            .element("1")
            .element("DOE JANE")
            .element("")
            .element("");
        assert_eq!(seg.render(), "NM1*QC*1*DOE JANE~");
    }

    #[test]
    fn render_keeps_interior_empty_elements() {
        let seg = Segment::new("NM1")
            .element("QC")
            .element("")
            .element("DOE JANE");
        assert_eq!(seg.render(), "NM1*QC**DOE JANE~");
    }

    #[test]
    fn amounts_strip_trailing_zeros() {
        assert_eq!(fmt_amount(dec!(150.00)), "150");
        assert_eq!(fmt_amount(dec!(150.50)), "150.5");
        assert_eq!(fmt_amount(dec!(0)), "0");
        assert_eq!(fmt_amount(dec!(12.345)), "12.35");
    }

    #[test]
    fn dates_render_compact() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
        assert_eq!(fmt_date(date), "20240105");
    }

    proptest! {
        #[test]
        fn sanitized_elements_never_break_grammar(value in ".*") {
            let rendered = Segment::new("REF").element(&value).render();
            // Exactly one terminator, at the end.
            prop_assert_eq!(rendered.matches(SEGMENT_TERMINATOR).count(), 1);
            prop_assert!(rendered.ends_with(SEGMENT_TERMINATOR));
            // At most one separator: the one between id and element.
            prop_assert!(rendered.matches(ELEMENT_SEPARATOR).count() <= 1);
        }
    }
}
