//! The denormalized view of a submission and its people, rebuilt from the two source tables.

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{json, Value};

use crate::{
	document::Document,
	infra::db::entities::{child_record, main_record, unified_record},
	processor::parse_date,
};

mod rules;

pub use rules::{age, PropertyBasis, PropertyUse, Rules};

const PROPERTY_COORDINATES_POINTS: u32 = 10;
const FIRST_NAME_POINTS: u32 = 10;
const GENDER_POINTS: u32 = 10;
const BIRTH_DATE_POINTS: u32 = 15;
const MOBILE_POINTS: u32 = 15;
const TIN_POINTS: u32 = 20;
const RENT_POINTS: u32 = 20;

/// One validated repeat group entry, as embedded in `child_details`.
#[derive(Debug, Clone, PartialEq)]
struct Person {
	uuid: String,
	basis: Option<PropertyBasis>,
	property_use: PropertyUse,
	first_name: Option<String>,
	last_name: Option<String>,
	business_name: Option<String>,
	entity_type: Option<String>,
	gender: Option<String>,
	date_of_birth: Option<NaiveDate>,
	age: Option<u32>,
	mobile_1: Option<String>,
	mobile_2: Option<String>,
	email: Option<String>,
	tin: Option<String>,
	nin: Option<String>,
	shop_unit: Option<String>,
	occupancy_basis: Option<String>,
	payment_frequency: Option<String>,
	annual_rent: f64,
	currency: String,
	annual_rent_dalasi: f64,
}

impl Person {
	fn from_record(child: &child_record::Model, rules: &Rules, today: NaiveDate) -> Self {
		let person_type = Document::new(child.person_type.clone());
		let occupancy = Document::new(child.occupancy.clone());
		let attributes = Document::new(child.attributes.clone());

		let annual_rent = rules.rent(occupancy.get("rent_annual_amount"));
		let (currency, rate) = rules.currency(
			occupancy
				.text("rent_currency_unit")
				.or_else(|| occupancy.text("currency_unit"))
				.as_deref(),
		);
		let date_of_birth = Rules::birth_date(attributes.get("individual_dob"), today);

		Self {
			uuid: child.uuid.clone(),
			basis: PropertyBasis::classify(person_type.text("property_basis").as_deref()),
			property_use: PropertyUse::classify(occupancy.text("property_use").as_deref()),
			first_name: attributes.text("individual_first_name"),
			last_name: attributes.text("individual_last_name"),
			business_name: attributes.text("business_name"),
			entity_type: attributes.text("type"),
			gender: attributes.text("individual_gender").map(|gender| gender.to_lowercase()),
			age: date_of_birth.and_then(|dob| age(dob, today)),
			date_of_birth,
			mobile_1: rules.phone(attributes.text("mobile_1")),
			mobile_2: rules.phone(attributes.text("mobile_2")),
			email: rules.email(attributes.text("email")),
			tin: rules.tin(attributes.text("tin")),
			nin: rules.nin(attributes.text("individual_nin")),
			shop_unit: attributes.text("shop_apt_unit_number"),
			occupancy_basis: occupancy.text("occupancy_basis"),
			payment_frequency: occupancy.text("payment_frequency"),
			annual_rent,
			currency,
			annual_rent_dalasi: annual_rent * rate,
		}
	}

	fn quality_points(&self) -> u32 {
		[
			(self.first_name.is_some(), FIRST_NAME_POINTS),
			(self.gender.is_some(), GENDER_POINTS),
			(self.date_of_birth.is_some(), BIRTH_DATE_POINTS),
			(self.mobile_1.is_some(), MOBILE_POINTS),
			(self.tin.is_some(), TIN_POINTS),
			(self.annual_rent_dalasi > 0.0, RENT_POINTS),
		]
		.into_iter()
		.filter_map(|(present, points)| present.then_some(points))
		.sum()
	}

	fn to_json(&self) -> Value {
		json!({
			"uuid": self.uuid,
			"property_basis": self.basis.map(|basis| basis.to_string()),
			"property_use": self.property_use.to_string(),
			"first_name": self.first_name,
			"last_name": self.last_name,
			"business_name": self.business_name,
			"entity_type": self.entity_type,
			"gender": self.gender,
			"date_of_birth": self.date_of_birth.map(|dob| dob.to_string()),
			"age": self.age,
			"mobile_1": self.mobile_1,
			"mobile_2": self.mobile_2,
			"email": self.email,
			"tin": self.tin,
			"nin": self.nin,
			"shop_unit": self.shop_unit,
			"occupancy_basis": self.occupancy_basis,
			"payment_frequency": self.payment_frequency,
			"annual_rent": self.annual_rent,
			"currency": self.currency,
			"annual_rent_dalasi": self.annual_rent_dalasi,
		})
	}
}

#[derive(Debug, Default, Clone, Copy)]
struct Income {
	commercial: f64,
	residential: f64,
	business: f64,
}

impl Income {
	fn add(&mut self, property_use: PropertyUse, amount: f64) {
		match property_use {
			PropertyUse::Commercial => self.commercial += amount,
			PropertyUse::Residential => self.residential += amount,
			PropertyUse::Business => self.business += amount,
		}
	}
}

/// Computes the unified row of one submission from its stored row and its children.
#[must_use]
pub fn build_row(
	main: &main_record::Model,
	children: &[child_record::Model],
	rules: &Rules,
	now: DateTime<Utc>,
) -> unified_record::Model {
	let today = now.date_naive();

	let location = Document::new(main.location.clone());
	let description = Document::new(main.description.clone());
	let system = Document::new(main.system.clone());
	let follow_up = Document::new(main.follow_up.clone());

	let people = children
		.iter()
		.map(|child| Person::from_record(child, rules, today))
		.collect::<Vec<_>>();

	let mut income = Income::default();
	for person in &people {
		income.add(person.property_use, person.annual_rent_dalasi);
	}

	let rates = &rules.tax_rates;
	let commercial_tax = income.commercial * PropertyUse::Commercial.tax_rate(rates);
	let residential_tax = income.residential * PropertyUse::Residential.tax_rate(rates);
	let business_tax = income.business * PropertyUse::Business.tax_rate(rates);
	let total_tax = commercial_tax + residential_tax + business_tax;
	let amount_paid = Rules::amount(follow_up.get("amount_paid"));

	let (latitude, longitude) = rules.coordinates(&[
		(&description, "building__geopoint"),
		(&location, "centroid_gps"),
	]);

	let review_state = system.text("reviewState");

	unified_record::Model {
		uuid: main.uuid.clone(),
		submitted_at: main.submitted_at,
		survey_date: main
			.survey_date
			.or_else(|| system.get("surveyDate").and_then(parse_date))
			.or_else(|| main.submitted_at.map(|at| at.date_naive())),
		submitter_name: system.text("submitterName"),
		rejected: review_state
			.as_deref()
			.is_some_and(|state| state.eq_ignore_ascii_case("rejected")),
		review_state,

		address_plus_code: location.text("address_plus_code"),
		street: location.text("street_label"),
		town: location.text("town_label"),
		district: location.text("district_label"),
		property_name: description.text("property_name"),
		building_type: description.text("building_type"),
		units: rules.units(description.get("number_of_shops_apts_units")),
		latitude,
		longitude,

		child_details: Value::Array(people.iter().map(Person::to_json).collect()),
		child_count: i32::try_from(people.len()).unwrap_or(i32::MAX),
		owner_present: people
			.iter()
			.any(|person| person.basis == Some(PropertyBasis::Owner)),

		total_annual_rent: income.commercial + income.residential + income.business,
		commercial_income: income.commercial,
		residential_income: income.residential,
		business_income: income.business,
		commercial_tax,
		residential_tax,
		business_tax,
		total_tax,
		amount_paid,
		outstanding_balance: (total_tax - amount_paid).max(0.0),

		meeting_date: follow_up.get("meeting_date").and_then(parse_date),
		follow_up_status: Some(
			follow_up
				.text("follow_up_status")
				.unwrap_or_else(|| "new".to_string()),
		),

		data_quality_score: quality_score(latitude.is_some() && longitude.is_some(), &people),

		image_html: main.image_url.as_deref().map(img_tag),
		image_url: main.image_url.clone(),
		plus_code_html: main.plus_code_url.as_deref().map(img_tag),
		plus_code_url: main.plus_code_url.clone(),

		rebuilt_at: now,
	}
}

/// Property points plus the mean of the per person points, capped at 100.
fn quality_score(has_coordinates: bool, people: &[Person]) -> i32 {
	let property = if has_coordinates {
		PROPERTY_COORDINATES_POINTS
	} else {
		0
	};

	let people_points = if people.is_empty() {
		0.0
	} else {
		let total: u32 = people.iter().map(Person::quality_points).sum();
		f64::from(total) / people.len() as f64
	};

	(f64::from(property) + people_points).round().clamp(0.0, 100.0) as i32
}

fn img_tag(url: &str) -> String {
	let escaped = url
		.replace('&', "&amp;")
		.replace('"', "&quot;")
		.replace('<', "&lt;")
		.replace('>', "&gt;");

	format!(r#"<img src="{escaped}" width="100%" height="100%" />"#)
}
