//! Seeded synthetic `purchases` table for demos, benchmarks and tests.

use std::sync::Arc;

use arrow_array::{ArrayRef, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use chrono::{Duration, NaiveDate};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::AqeError;
use crate::storage::MemoryStorage;

pub const PURCHASES_TABLE: &str = "purchases";

const BATCH_ROWS: usize = 8192;

const COUNTRIES: [&str; 50] = [
    "US", "GB", "CA", "DE", "FR", "JP", "AU", "BR", "IN", "CN", "IT", "ES", "MX", "KR", "NL",
    "SE", "NO", "DK", "FI", "PL", "PT", "IE", "BE", "AT", "CH", "CZ", "HU", "GR", "TR", "IL",
    "EG", "ZA", "NG", "KE", "AR", "CL", "CO", "PE", "NZ", "SG", "MY", "TH", "VN", "ID", "PH",
    "AE", "SA", "RU", "UA", "RO",
];

const CITIES: [&str; 10] = [
    "New York", "London", "Toronto", "Berlin", "Paris", "Tokyo", "Sydney", "Rio", "Mumbai",
    "Beijing",
];

const CATEGORIES: [&str; 10] = [
    "Electronics", "Clothing", "Food", "Books", "Home", "Sports", "Toys", "Beauty", "Garden",
    "Automotive",
];

pub fn purchases_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("customer_id", DataType::Int64, false),
        Field::new("product_id", DataType::Int64, false),
        Field::new("amount", DataType::Float64, false),
        Field::new("country", DataType::Utf8, false),
        Field::new("city", DataType::Utf8, false),
        Field::new("category", DataType::Utf8, false),
        Field::new("purchase_date", DataType::Utf8, false),
    ]))
}

/// Uniformly distributed purchases over one year starting 2023-01-01.
#[derive(Debug, Clone)]
pub struct PurchasesGenerator {
    rows: usize,
    countries: usize,
    seed: u64,
}

impl PurchasesGenerator {
    /// `countries` is clamped to `1..=50`.
    pub fn new(rows: usize, countries: usize, seed: u64) -> Self {
        Self {
            rows,
            countries: countries.clamp(1, COUNTRIES.len()),
            seed,
        }
    }

    pub fn batches(&self) -> Result<Vec<RecordBatch>, AqeError> {
        let schema = purchases_schema();
        let mut rng = StdRng::seed_from_u64(self.seed);
        let start = NaiveDate::from_ymd_opt(2023, 1, 1)
            .ok_or_else(|| AqeError::Configuration("invalid start date".into()))?;

        let mut batches = Vec::with_capacity(self.rows.div_ceil(BATCH_ROWS));
        let mut next_id = 1i64;
        let mut remaining = self.rows;
        while remaining > 0 {
            let n = remaining.min(BATCH_ROWS);
            remaining -= n;

            let mut ids = Vec::with_capacity(n);
            let mut customers = Vec::with_capacity(n);
            let mut products = Vec::with_capacity(n);
            let mut amounts = Vec::with_capacity(n);
            let mut countries = Vec::with_capacity(n);
            let mut cities = Vec::with_capacity(n);
            let mut categories = Vec::with_capacity(n);
            let mut dates = Vec::with_capacity(n);
            for _ in 0..n {
                ids.push(next_id);
                next_id += 1;
                customers.push(rng.gen_range(1..=50_000i64));
                products.push(rng.gen_range(1..=10_000i64));
                let cents: i64 = rng.gen_range(1_000..=100_000);
                amounts.push(cents as f64 / 100.0);
                countries.push(COUNTRIES[rng.gen_range(0..self.countries)]);
                cities.push(CITIES[rng.gen_range(0..CITIES.len())]);
                categories.push(CATEGORIES[rng.gen_range(0..CATEGORIES.len())]);
                let day = start + Duration::days(rng.gen_range(0..=365));
                dates.push(day.format("%Y-%m-%d").to_string());
            }

            let columns: Vec<ArrayRef> = vec![
                Arc::new(Int64Array::from(ids)),
                Arc::new(Int64Array::from(customers)),
                Arc::new(Int64Array::from(products)),
                Arc::new(Float64Array::from(amounts)),
                Arc::new(StringArray::from(countries)),
                Arc::new(StringArray::from(cities)),
                Arc::new(StringArray::from(categories)),
                Arc::new(StringArray::from(dates)),
            ];
            batches.push(RecordBatch::try_new(schema.clone(), columns)?);
        }
        Ok(batches)
    }

    /// A fresh in-memory storage holding the generated table.
    pub fn into_storage(self) -> Result<MemoryStorage, AqeError> {
        let storage = MemoryStorage::new();
        self.register_into(&storage)?;
        Ok(storage)
    }

    /// Create or replace the purchases table in `storage`.
    pub fn register_into(&self, storage: &MemoryStorage) -> Result<(), AqeError> {
        storage.register_table(PURCHASES_TABLE, purchases_schema(), self.batches()?)
    }
}
