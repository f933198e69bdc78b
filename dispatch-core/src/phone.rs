use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::PhoneConfig;
use crate::error::DispatchError;

/// A phone number in the single dialable form the gateway expects:
/// digits only, prefixed with the country code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NormalizedPhone(String);

impl NormalizedPhone {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for NormalizedPhone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NormalizedPhone {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Canonicalizes raw phone numbers. Pure: the same input always yields the
/// same output, which fingerprint deduplication relies on.
#[derive(Debug, Clone)]
pub struct PhoneNormalizer {
    config: PhoneConfig,
}

impl PhoneNormalizer {
    pub fn new(config: PhoneConfig) -> Self {
        Self { config }
    }

    pub fn normalize(&self, raw: &str) -> Result<NormalizedPhone, DispatchError> {
        let invalid = |reason: String| DispatchError::InvalidPhone {
            raw: raw.to_string(),
            reason,
        };

        let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            return Err(invalid("no digits".to_string()));
        }

        let country_code = self.config.country_code.as_str();
        let trunk_prefix = self.config.trunk_prefix.as_str();

        // Length bounds apply to the full number, country code included.
        let normalized = if !trunk_prefix.is_empty() && digits.starts_with(trunk_prefix) {
            format!("{}{}", country_code, &digits[trunk_prefix.len()..])
        } else if digits.starts_with(country_code) {
            digits
        } else {
            format!("{}{}", country_code, digits)
        };

        let len = normalized.len();
        if len < self.config.min_length || len > self.config.max_length {
            return Err(invalid(format!(
                "{} digits, expected {}-{}",
                len, self.config.min_length, self.config.max_length
            )));
        }

        Ok(NormalizedPhone(normalized))
    }
}

impl Default for PhoneNormalizer {
    fn default() -> Self {
        Self::new(PhoneConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn normalize(raw: &str) -> Result<NormalizedPhone, DispatchError> {
        PhoneNormalizer::default().normalize(raw)
    }

    #[test]
    fn local_trunk_prefix_is_replaced() {
        assert_eq!(normalize("081234567890").unwrap().as_str(), "6281234567890");
    }

    #[test]
    fn international_format_is_kept() {
        assert_eq!(normalize("+6281234567890").unwrap().as_str(), "6281234567890");
        assert_eq!(normalize("+62 812-3456-7890").unwrap().as_str(), "6281234567890");
    }

    #[test]
    fn missing_country_code_is_prepended() {
        assert_eq!(normalize("81234567890").unwrap().as_str(), "6281234567890");
    }

    #[test]
    fn rejects_numbers_without_digits() {
        let err = normalize("n/a").unwrap_err();
        assert_eq!(err.kind(), "invalid_phone");
    }

    #[test]
    fn rejects_out_of_range_lengths() {
        assert!(normalize("0812").is_err());
        assert!(normalize("08123456789012345").is_err());
    }

    #[test]
    fn honours_configured_country_code() {
        let normalizer = PhoneNormalizer::new(PhoneConfig {
            country_code: "60".to_string(),
            ..Default::default()
        });
        assert_eq!(normalizer.normalize("0123456789").unwrap().as_str(), "60123456789");
    }

    proptest! {
        #[test]
        fn normalization_is_idempotent(raw in "[+ ()-]{0,2}[0-9]{9,13}[ -]{0,1}") {
            if let Ok(first) = normalize(&raw) {
                let second = normalize(first.as_str()).unwrap();
                prop_assert_eq!(second, first);
            }
        }
    }
}
