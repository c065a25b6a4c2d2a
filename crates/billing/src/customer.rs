//! Customer records

use serde::Deserialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{split_name, Customer, LifecycleStage};

const CUSTOMER_COLUMNS: &str = "id, email, first_name, last_name, phone, external_customer_id, \
     billing_address, preferred_currency, lifecycle_stage, total_lifetime_value_cents, \
     churn_risk_score, created_at, updated_at, last_activity_at";

#[derive(Debug, Clone, Deserialize)]
pub struct CreateCustomer {
    pub email: String,
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
}

impl CreateCustomer {
    /// Normalize and check the request
    pub fn validate(&self) -> BillingResult<(String, String, String, Option<String>)> {
        let email = normalize_email(&self.email)?;
        let (first, last) = split_name(&self.name);
        let phone = self
            .phone
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string);
        Ok((email, first, last, phone))
    }
}

/// Lowercase and sanity-check an email address
pub fn normalize_email(raw: &str) -> BillingResult<String> {
    let email = raw.trim().to_lowercase();
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.contains(char::is_whitespace)
                && !domain.contains('@')
        }
        None => false,
    };
    if valid {
        Ok(email)
    } else {
        Err(BillingError::InvalidInput(format!(
            "invalid email address: {raw}"
        )))
    }
}

#[derive(Clone)]
pub struct CustomerService {
    pool: PgPool,
}

impl CustomerService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create_customer(&self, request: &CreateCustomer) -> BillingResult<Customer> {
        let (email, first_name, last_name, phone) = request.validate()?;

        let sql = format!(
            r#"
            INSERT INTO customers (email, first_name, last_name, phone, lifecycle_stage)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (email) DO NOTHING
            RETURNING {CUSTOMER_COLUMNS}
            "#
        );
        let customer = sqlx::query_as::<_, Customer>(&sql)
            .bind(&email)
            .bind(&first_name)
            .bind(&last_name)
            .bind(&phone)
            .bind(LifecycleStage::Prospect.as_str())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| {
                BillingError::InvalidInput(format!("customer with email {email} already exists"))
            })?;

        tracing::info!(customer_id = %customer.id, "Customer created");
        Ok(customer)
    }

    pub async fn get_customer(&self, id: Uuid) -> BillingResult<Customer> {
        let sql = format!("SELECT {CUSTOMER_COLUMNS} FROM customers WHERE id = $1");
        sqlx::query_as::<_, Customer>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| BillingError::CustomerNotFound(id.to_string()))
    }

    pub async fn find_by_external_id(&self, external_id: &str) -> BillingResult<Option<Customer>> {
        let sql = format!("SELECT {CUSTOMER_COLUMNS} FROM customers WHERE external_customer_id = $1");
        let customer = sqlx::query_as::<_, Customer>(&sql)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(customer)
    }

    pub async fn set_lifecycle_stage(
        &self,
        id: Uuid,
        stage: LifecycleStage,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            "UPDATE customers SET lifecycle_stage = $2, updated_at = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(stage.as_str())
        .bind(OffsetDateTime::now_utc())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::CustomerNotFound(id.to_string()));
        }
        tracing::info!(customer_id = %id, stage = %stage, "Customer lifecycle updated");
        Ok(())
    }
}
