use chrono::NaiveDate;
use regex::Regex;
use serde_json::Value;

use crate::{
	config::{CurrencyRate, TaxRates, UnifiedConfig},
	document::{value_number, Document},
	processor::parse_date,
};

const EARLIEST_BIRTH_DATE: (i32, u32, u32) = (1900, 1, 1);

/// How a unit is used, which decides the tax rate applied to its rent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum PropertyUse {
	Commercial,
	Residential,
	Business,
}

impl PropertyUse {
	#[must_use]
	pub fn classify(raw: Option<&str>) -> Self {
		match raw.map(|raw| raw.trim().to_lowercase()).as_deref() {
			Some("place-of-business" | "commercial" | "business" | "shop" | "office") => {
				Self::Commercial
			}
			Some("residence" | "residential" | "home" | "apartment") => Self::Residential,
			_ => Self::Business,
		}
	}

	#[must_use]
	pub const fn tax_rate(self, rates: &TaxRates) -> f64 {
		match self {
			Self::Commercial => rates.commercial,
			Self::Residential => rates.residential,
			Self::Business => rates.business,
		}
	}
}

/// Relation of a person to the property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum PropertyBasis {
	Owner,
	Landlord,
	Occupant,
}

impl PropertyBasis {
	#[must_use]
	pub fn classify(raw: Option<&str>) -> Option<Self> {
		match raw?.trim().to_lowercase().as_str() {
			"owner" | "proprietor" => Some(Self::Owner),
			"landlord" | "agent" => Some(Self::Landlord),
			"occupant" | "tenant" | "renter" => Some(Self::Occupant),
			_ => None,
		}
	}
}

/// Validation rules of the unified table, compiled once from [`UnifiedConfig`].
#[derive(Debug, Clone)]
pub struct Rules {
	latitude: (f64, f64),
	longitude: (f64, f64),
	max_amount: f64,
	max_units: i32,
	phone: Regex,
	tin: Regex,
	nin: Regex,
	email: Regex,
	currencies: Vec<CurrencyRate>,
	pub(crate) tax_rates: TaxRates,
}

impl Rules {
	pub fn compile(config: &UnifiedConfig) -> Result<Self, regex::Error> {
		Ok(Self {
			latitude: config.latitude,
			longitude: config.longitude,
			max_amount: config.max_amount,
			max_units: config.max_units,
			phone: Regex::new(&config.phone_pattern)?,
			tin: Regex::new(&config.tin_pattern)?,
			nin: Regex::new(&config.nin_pattern)?,
			email: Regex::new(&config.email_pattern)?,
			currencies: config.currencies.clone(),
			tax_rates: config.tax_rates,
		})
	}

	/// `(latitude, longitude)` from GeoJSON `coordinates` (longitude first), each kept only when
	/// inside the survey area. The building point wins over the centroid per axis.
	#[must_use]
	pub fn coordinates(&self, candidates: &[(&Document, &str)]) -> (Option<f64>, Option<f64>) {
		let axis = |index: usize, (low, high): (f64, f64)| {
			candidates.iter().find_map(|(doc, path)| {
				doc.number(&format!("{path}.coordinates.{index}"))
					.filter(|value| (low..=high).contains(value))
			})
		};

		(axis(1, self.latitude), axis(0, self.longitude))
	}

	/// Whole number of units within bounds, else 1.
	#[must_use]
	pub fn units(&self, value: Option<&Value>) -> i32 {
		value
			.and_then(value_number)
			.filter(|units| units.fract() == 0.0 && *units >= 1.0 && *units <= f64::from(self.max_units))
			.map_or(1, |units| units as i32)
	}

	/// Annual rent, `0 < rent <= max_amount` or 0.
	#[must_use]
	pub fn rent(&self, value: Option<&Value>) -> f64 {
		value
			.and_then(value_number)
			.filter(|rent| *rent > 0.0 && *rent <= self.max_amount)
			.unwrap_or(0.0)
	}

	/// Non-negative amount or 0.
	#[must_use]
	pub fn amount(value: Option<&Value>) -> f64 {
		value
			.and_then(value_number)
			.filter(|amount| *amount >= 0.0)
			.unwrap_or(0.0)
	}

	/// Canonical currency name and its rate to the base currency. Unknown or missing
	/// currencies are treated as the base currency.
	#[must_use]
	pub fn currency(&self, raw: Option<&str>) -> (String, f64) {
		let raw = raw.map(|raw| raw.trim().to_lowercase()).unwrap_or_default();

		self.currencies
			.iter()
			.find(|currency| currency.name == raw || currency.aliases.iter().any(|alias| *alias == raw))
			.or_else(|| self.currencies.first())
			.map_or_else(|| (String::new(), 1.0), |currency| (currency.name.clone(), currency.rate))
	}

	#[must_use]
	pub fn phone(&self, raw: Option<String>) -> Option<String> {
		raw.filter(|phone| self.phone.is_match(phone))
	}

	#[must_use]
	pub fn tin(&self, raw: Option<String>) -> Option<String> {
		raw.filter(|tin| self.tin.is_match(tin))
	}

	#[must_use]
	pub fn nin(&self, raw: Option<String>) -> Option<String> {
		raw.filter(|nin| self.nin.is_match(nin))
	}

	#[must_use]
	pub fn email(&self, raw: Option<String>) -> Option<String> {
		raw.filter(|email| self.email.is_match(email))
			.map(|email| email.to_lowercase())
	}

	/// ISO date of birth, not before 1900 nor after `today`.
	#[must_use]
	pub fn birth_date(value: Option<&Value>, today: NaiveDate) -> Option<NaiveDate> {
		let (year, month, day) = EARLIEST_BIRTH_DATE;
		let earliest = NaiveDate::from_ymd_opt(year, month, day)?;

		value
			.and_then(parse_date)
			.filter(|dob| *dob >= earliest && *dob <= today)
	}
}

/// Age in whole years on `today`.
#[must_use]
pub fn age(dob: NaiveDate, today: NaiveDate) -> Option<u32> {
	today.years_since(dob)
}

#[cfg(test)]
mod tests {
	use super::*;

	use serde_json::json;

	fn rules() -> Rules {
		Rules::compile(&UnifiedConfig::default()).unwrap()
	}

	#[test]
	fn coordinates_fall_back_per_axis() {
		let description = Document::new(json!({"building__geopoint": {"coordinates": [-16.7, 2.0]}}));
		let location = Document::new(json!({"centroid_gps": {"coordinates": ["-16.5", 13.4]}}));
		let candidates = [(&description, "building__geopoint"), (&location, "centroid_gps")];

		assert_eq!(rules().coordinates(&candidates), (Some(13.4), Some(-16.7)));

		let empty = Document::default();
		assert_eq!(rules().coordinates(&[(&empty, "centroid_gps")]), (None, None));
	}

	#[test]
	fn numeric_bounds() {
		let rules = rules();

		assert_eq!(rules.units(Some(&json!("12"))), 12);
		assert_eq!(rules.units(Some(&json!(2.5))), 1);
		assert_eq!(rules.units(Some(&json!(1001))), 1);
		assert_eq!(rules.units(None), 1);

		assert_eq!(rules.rent(Some(&json!("25000"))), 25_000.0);
		assert_eq!(rules.rent(Some(&json!(-4))), 0.0);
		assert_eq!(rules.rent(Some(&json!(10_000_001))), 0.0);

		assert_eq!(Rules::amount(Some(&json!("150.5"))), 150.5);
		assert_eq!(Rules::amount(Some(&json!(-1))), 0.0);
	}

	#[test]
	fn currencies_convert_to_dalasi() {
		let rules = rules();

		assert_eq!(rules.currency(Some(" USD ")), ("usd".to_string(), 71.43));
		assert_eq!(rules.currency(Some("£")), ("pound".to_string(), 90.91));
		assert_eq!(rules.currency(Some("yen")), ("dalasi".to_string(), 1.0));
		assert_eq!(rules.currency(None), ("dalasi".to_string(), 1.0));
	}

	#[test]
	fn identifiers_are_validated() {
		let rules = rules();

		assert_eq!(rules.phone(Some("+2207012345".into())).as_deref(), Some("+2207012345"));
		assert_eq!(rules.phone(Some("12".into())), None);
		assert_eq!(rules.tin(Some("0123456789".into())).as_deref(), Some("0123456789"));
		assert_eq!(rules.tin(Some("12345".into())), None);
		assert_eq!(rules.nin(Some("123456789".into())).as_deref(), Some("123456789"));
		assert_eq!(rules.email(Some("Awa.Jallow@Example.GM".into())).as_deref(), Some("awa.jallow@example.gm"));
		assert_eq!(rules.email(Some("nope".into())), None);
	}

	#[test]
	fn birth_dates_and_ages() {
		let today = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();

		let dob = Rules::birth_date(Some(&json!("1990-05-02")), today).unwrap();
		assert_eq!(age(dob, today), Some(33));
		assert_eq!(Rules::birth_date(Some(&json!("1899-12-31")), today), None);
		assert_eq!(Rules::birth_date(Some(&json!("2030-01-01")), today), None);
	}

	#[test]
	fn property_classification() {
		assert_eq!(PropertyUse::classify(Some("Place-of-Business")), PropertyUse::Commercial);
		assert_eq!(PropertyUse::classify(Some("home")), PropertyUse::Residential);
		assert_eq!(PropertyUse::classify(Some("warehouse")), PropertyUse::Business);
		assert_eq!(PropertyUse::classify(None), PropertyUse::Business);
		assert_eq!(PropertyBasis::classify(Some(" Proprietor")), Some(PropertyBasis::Owner));
		assert_eq!(PropertyBasis::classify(Some("tenant")), Some(PropertyBasis::Occupant));
		assert_eq!(PropertyBasis::classify(Some("")), None);
	}
}
