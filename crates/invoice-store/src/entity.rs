//! Client and invoice records with field validation.

use std::sync::OnceLock;

use regex::Regex;
use resilience_core::StoredRecord;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

const GSTIN_LEN: usize = 15;

/// Domain payload stored in one backend collection.
pub trait EntityKind: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Partial update; absent fields are left unchanged.
    type Patch: Clone + Serialize + Send + Sync + 'static;

    const COLLECTION: &'static str;
    /// Singular display name used in notices, e.g. "Client".
    const LABEL: &'static str;
    /// Shown when the backend reports a unique key violation on create.
    const DUPLICATE_MESSAGE: &'static str;

    /// Check required fields. `Err` carries a message safe to show verbatim.
    fn validate(&self) -> Result<(), String>;

    /// Check only the fields present in `patch`.
    fn validate_patch(patch: &Self::Patch) -> Result<(), String>;
}

/// A stored entity with its server-assigned id and timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity<T> {
    pub id: String,
    pub created_at_ms: u64,
    /// Optimistic concurrency token; must be echoed back on update.
    pub updated_at_ms: u64,
    pub data: T,
}

impl<T: EntityKind> Entity<T> {
    pub fn from_record(record: StoredRecord) -> Result<Self, serde_json::Error> {
        Ok(Self {
            data: serde_json::from_value(record.fields)?,
            id: record.id,
            created_at_ms: record.created_at_ms,
            updated_at_ms: record.updated_at_ms,
        })
    }
}

impl Entity<Invoice> {
    pub fn total(&self) -> f64 {
        self.data.total()
    }
}

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email regex is valid"))
}

fn currency_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z]{3}$").expect("currency regex is valid"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub name: String,
    pub email: String,
    pub billing_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gstin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
}

impl Client {
    pub fn new(
        name: impl Into<String>,
        email: impl Into<String>,
        billing_address: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            billing_address: billing_address.into(),
            gstin: None,
            phone: None,
            company: None,
        }
    }

    pub fn with_gstin(mut self, gstin: impl Into<String>) -> Self {
        self.gstin = Some(gstin.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub billing_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gstin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
}

fn check_name(name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("Client name is required.".to_owned());
    }
    Ok(())
}

fn check_email(email: &str) -> Result<(), String> {
    if !email_regex().is_match(email.trim()) {
        return Err("Please enter a valid email address.".to_owned());
    }
    Ok(())
}

fn check_address(address: &str) -> Result<(), String> {
    if address.trim().is_empty() {
        return Err("Billing address is required.".to_owned());
    }
    Ok(())
}

/// An empty GSTIN counts as absent.
fn check_gstin(gstin: Option<&str>) -> Result<(), String> {
    match gstin.map(str::trim) {
        Some(value) if !value.is_empty() && value.chars().count() != GSTIN_LEN => {
            Err(format!("GSTIN must be exactly {GSTIN_LEN} characters."))
        }
        _ => Ok(()),
    }
}

impl EntityKind for Client {
    type Patch = ClientPatch;

    const COLLECTION: &'static str = "clients";
    const LABEL: &'static str = "Client";
    const DUPLICATE_MESSAGE: &'static str = "A record with this email already exists.";

    fn validate(&self) -> Result<(), String> {
        check_name(&self.name)?;
        check_email(&self.email)?;
        check_address(&self.billing_address)?;
        check_gstin(self.gstin.as_deref())
    }

    fn validate_patch(patch: &ClientPatch) -> Result<(), String> {
        if let Some(name) = &patch.name {
            check_name(name)?;
        }
        if let Some(email) = &patch.email {
            check_email(email)?;
        }
        if let Some(address) = &patch.billing_address {
            check_address(address)?;
        }
        check_gstin(patch.gstin.as_deref())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    #[default]
    Draft,
    Sent,
    Paid,
    Overdue,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub quantity: f64,
    pub unit_price: f64,
}

impl LineItem {
    pub fn new(description: impl Into<String>, quantity: f64, unit_price: f64) -> Self {
        Self {
            description: description.into(),
            quantity,
            unit_price,
        }
    }

    pub fn amount(&self) -> f64 {
        self.quantity * self.unit_price
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub invoice_number: String,
    pub client_id: String,
    /// `YYYY-MM-DD`.
    pub issue_date: String,
    /// `YYYY-MM-DD`.
    pub due_date: String,
    /// ISO 4217 code.
    pub currency: String,
    #[serde(default)]
    pub status: InvoiceStatus,
    pub line_items: Vec<LineItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Invoice {
    pub fn total(&self) -> f64 {
        self.line_items.iter().map(LineItem::amount).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvoicePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<InvoiceStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_items: Option<Vec<LineItem>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

fn check_invoice_number(number: &str) -> Result<(), String> {
    if number.trim().is_empty() {
        return Err("Invoice number is required.".to_owned());
    }
    Ok(())
}

fn check_client_id(client_id: &str) -> Result<(), String> {
    if client_id.trim().is_empty() {
        return Err("Select a client for this invoice.".to_owned());
    }
    Ok(())
}

fn check_currency(currency: &str) -> Result<(), String> {
    if !currency_regex().is_match(currency.trim()) {
        return Err("Currency must be a 3-letter code.".to_owned());
    }
    Ok(())
}

fn check_line_items(items: &[LineItem]) -> Result<(), String> {
    if items.is_empty() {
        return Err("Add at least one line item.".to_owned());
    }
    for item in items {
        if !(item.quantity.is_finite() && item.quantity > 0.0) {
            return Err("Line item quantities must be greater than zero.".to_owned());
        }
        if !(item.unit_price.is_finite() && item.unit_price >= 0.0) {
            return Err("Line item prices cannot be negative.".to_owned());
        }
    }
    Ok(())
}

// ISO dates compare correctly as strings.
fn check_dates(issue_date: &str, due_date: &str) -> Result<(), String> {
    if !issue_date.is_empty() && !due_date.is_empty() && due_date < issue_date {
        return Err("Due date cannot be before the issue date.".to_owned());
    }
    Ok(())
}

impl EntityKind for Invoice {
    type Patch = InvoicePatch;

    const COLLECTION: &'static str = "invoices";
    const LABEL: &'static str = "Invoice";
    const DUPLICATE_MESSAGE: &'static str = "A record with this invoice number already exists.";

    fn validate(&self) -> Result<(), String> {
        check_invoice_number(&self.invoice_number)?;
        check_client_id(&self.client_id)?;
        check_currency(&self.currency)?;
        check_line_items(&self.line_items)?;
        check_dates(&self.issue_date, &self.due_date)
    }

    fn validate_patch(patch: &InvoicePatch) -> Result<(), String> {
        if let Some(number) = &patch.invoice_number {
            check_invoice_number(number)?;
        }
        if let Some(client_id) = &patch.client_id {
            check_client_id(client_id)?;
        }
        if let Some(currency) = &patch.currency {
            check_currency(currency)?;
        }
        if let Some(items) = &patch.line_items {
            check_line_items(items)?;
        }
        if let (Some(issue), Some(due)) = (&patch.issue_date, &patch.due_date) {
            check_dates(issue, due)?;
        }
        Ok(())
    }
}
