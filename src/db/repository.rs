use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension, Row, TransactionBehavior};
use tokio_rusqlite::Connection;

use crate::error::{AppError, Result};
use crate::models::{
    CadenceTier, ChannelKind, Contact, Coordinates, DeliveryRecord, IncidentRecord, Location,
    NewDelivery, NewIncident, NewSubscription, Severity, Subscription, DEFAULT_RADIUS_KM,
};

use super::schema::SCHEMA;
use super::store::{
    CoverageConflict, DeliveryStore, IncidentQuery, IncidentStore, RecipientResolver,
    SubscriptionStore,
};

pub struct Repository {
    conn: Connection,
}

impl Repository {
    pub async fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).await?;
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self> {
        conn.call(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    // Subscription operations (used by the management API and fixtures)

    pub async fn insert_subscription(&self, sub: NewSubscription) -> Result<i64> {
        let categories = serde_json::to_string(&sub.categories)?;
        let severities = serde_json::to_string(&sub.severities)?;
        let channels = serde_json::to_string(&sub.channels)?;
        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    r#"INSERT INTO subscriptions
                           (owner_id, name, latitude, longitude, location_label, radius_km,
                            categories, severities, channels, cadence, active)
                       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"#,
                    params![
                        sub.owner_id,
                        sub.name,
                        sub.center.latitude,
                        sub.center.longitude,
                        sub.location_label,
                        sub.radius_km,
                        categories,
                        severities,
                        channels,
                        sub.cadence.as_str(),
                        sub.active,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(id)
    }

    // Incident operations (used by ingestion and fixtures)

    pub async fn insert_incident(&self, incident: NewIncident) -> Result<i64> {
        let id = self
            .conn
            .call(move |conn| {
                let coordinates = incident.location.coordinates;
                conn.execute(
                    r#"INSERT INTO incidents
                           (category, severity, description, latitude, longitude, address, occurred_at)
                       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
                    params![
                        incident.category,
                        incident.severity.as_str(),
                        incident.description,
                        coordinates.map(|c| c.latitude),
                        coordinates.map(|c| c.longitude),
                        incident.location.address,
                        format_timestamp(&incident.occurred_at),
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(id)
    }

    // Contact operations

    pub async fn upsert_contact(&self, owner_id: &str, contact: Contact) -> Result<()> {
        let owner_id = owner_id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"INSERT INTO contacts (owner_id, email, phone)
                       VALUES (?1, ?2, ?3)
                       ON CONFLICT(owner_id) DO UPDATE SET
                           email = excluded.email,
                           phone = excluded.phone,
                           updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')"#,
                    params![owner_id, contact.email, contact.phone],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // Audit export

    /// Every delivery recorded for a subscription, newest first.
    pub async fn deliveries_for_subscription(
        &self,
        subscription_id: i64,
    ) -> Result<Vec<DeliveryRecord>> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    r#"SELECT id, subscription_id, owner_id, tier, channels_succeeded, incident_count, sent_at
                       FROM deliveries
                       WHERE subscription_id = ?1
                       ORDER BY sent_at DESC, id DESC"#,
                )?;
                let deliveries = stmt
                    .query_map(params![subscription_id], delivery_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                let incidents = load_delivery_incidents(conn, &deliveries)?;
                Ok((deliveries, incidents))
            })
            .await?;
        assemble_deliveries(rows)
    }
}

#[async_trait]
impl SubscriptionStore for Repository {
    async fn list_active(&self, tier: CadenceTier) -> Result<Vec<Subscription>> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    r#"SELECT id, owner_id, name, latitude, longitude, location_label, radius_km,
                              categories, severities, channels, cadence, active, created_at, updated_at
                       FROM subscriptions
                       WHERE active = 1 AND lower(cadence) = ?1
                       ORDER BY id"#,
                )?;
                let rows = stmt
                    .query_map(params![tier.as_str()], subscription_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let subscriptions = rows
            .into_iter()
            .filter_map(|row| match row.into_subscription() {
                Ok(sub) => Some(sub),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping malformed subscription");
                    None
                }
            })
            .collect();
        Ok(subscriptions)
    }
}

#[async_trait]
impl IncidentStore for Repository {
    async fn query(&self, query: IncidentQuery) -> Result<Vec<IncidentRecord>> {
        let (sql, values) = build_incident_query(&query);
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params_from_iter(values.iter()), incident_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let incidents = rows
            .into_iter()
            .filter_map(|row| {
                let id = row.id;
                match row.into_incident() {
                    Ok(incident) => Some(incident),
                    Err(reason) => {
                        tracing::warn!(incident_id = id, %reason, "Skipping unreadable incident");
                        None
                    }
                }
            })
            .collect();
        Ok(incidents)
    }
}

#[async_trait]
impl DeliveryStore for Repository {
    async fn find_covering(
        &self,
        subscription_id: i64,
        tier: CadenceTier,
        since: DateTime<Utc>,
    ) -> Result<Vec<DeliveryRecord>> {
        let since = format_timestamp(&since);
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    r#"SELECT id, subscription_id, owner_id, tier, channels_succeeded, incident_count, sent_at
                       FROM deliveries
                       WHERE subscription_id = ?1 AND tier = ?2 AND sent_at >= ?3
                       ORDER BY sent_at, id"#,
                )?;
                let deliveries = stmt
                    .query_map(params![subscription_id, tier.as_str(), since], delivery_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                let incidents = load_delivery_incidents(conn, &deliveries)?;
                Ok((deliveries, incidents))
            })
            .await?;
        assemble_deliveries(rows)
    }

    async fn insert_if_absent(
        &self,
        delivery: NewDelivery,
        conflict: CoverageConflict,
    ) -> Result<DeliveryRecord> {
        let channels = serde_json::to_string(&delivery.channels_succeeded)?;
        let since = format_timestamp(&conflict.since);
        let sent_at = format_timestamp(&delivery.sent_at);

        let committed = self
            .conn
            .call(move |conn| {
                // IMMEDIATE takes the write lock up front so the overlap check
                // and the insert see the same state.
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                let overlapping = {
                    let mut stmt = tx.prepare(
                        r#"SELECT 1 FROM delivery_incidents
                           WHERE subscription_id = ?1 AND tier = ?2 AND incident_id = ?3 AND sent_at >= ?4
                           LIMIT 1"#,
                    )?;
                    let mut found = false;
                    for incident_id in &delivery.incident_ids {
                        if stmt.exists(params![
                            conflict.subscription_id,
                            conflict.tier.as_str(),
                            incident_id,
                            since
                        ])? {
                            found = true;
                            break;
                        }
                    }
                    found
                };
                if overlapping {
                    return Ok(None);
                }

                tx.execute(
                    r#"INSERT INTO deliveries
                           (subscription_id, owner_id, tier, channels_succeeded, incident_count, sent_at)
                       VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
                    params![
                        delivery.subscription_id,
                        delivery.owner_id,
                        delivery.tier.as_str(),
                        channels,
                        delivery.incident_count as i64,
                        sent_at,
                    ],
                )?;
                let id = tx.last_insert_rowid();
                {
                    let mut stmt = tx.prepare(
                        r#"INSERT INTO delivery_incidents (delivery_id, subscription_id, tier, incident_id, sent_at)
                           VALUES (?1, ?2, ?3, ?4, ?5)"#,
                    )?;
                    for incident_id in &delivery.incident_ids {
                        stmt.execute(params![
                            id,
                            delivery.subscription_id,
                            delivery.tier.as_str(),
                            incident_id,
                            sent_at
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(Some(delivery.into_record(id)))
            })
            .await?;

        committed.ok_or(AppError::DedupConflict {
            subscription_id: conflict.subscription_id,
        })
    }
}

#[async_trait]
impl RecipientResolver for Repository {
    async fn resolve(&self, owner_id: &str) -> Result<Contact> {
        let owner_id = owner_id.to_string();
        let contact = self
            .conn
            .call(move |conn| {
                let contact = conn
                    .query_row(
                        "SELECT email, phone FROM contacts WHERE owner_id = ?1",
                        params![owner_id],
                        |row| {
                            Ok(Contact {
                                email: row.get(0)?,
                                phone: row.get(1)?,
                            })
                        },
                    )
                    .optional()?;
                Ok(contact)
            })
            .await?;
        Ok(contact.unwrap_or_default())
    }
}

/// Fixed-width UTC timestamps so that text comparison in SQL is
/// chronological.
pub fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    // Try RFC3339 first (e.g., "2026-01-11T12:34:56.000000Z")
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // Try SQLite datetime format (e.g., "2026-01-11 12:34:56")
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    None
}

fn build_incident_query(query: &IncidentQuery) -> (String, Vec<Value>) {
    let mut sql = String::from(
        "SELECT id, category, severity, description, latitude, longitude, address, occurred_at \
         FROM incidents WHERE julianday(occurred_at) >= julianday(?)",
    );
    let mut values = vec![Value::Text(format_timestamp(&query.since))];

    if let Some(categories) = query.categories.as_ref().filter(|c| !c.is_empty()) {
        sql.push_str(&format!(
            " AND category COLLATE NOCASE IN ({})",
            placeholders(categories.len())
        ));
        values.extend(categories.iter().cloned().map(Value::Text));
    }
    if let Some(severities) = query.severities.as_ref().filter(|s| !s.is_empty()) {
        sql.push_str(&format!(
            " AND severity COLLATE NOCASE IN ({})",
            placeholders(severities.len())
        ));
        values.extend(severities.iter().map(|s| Value::Text(s.as_str().to_string())));
    }
    if let Some(bbox) = query.bbox {
        sql.push_str(" AND latitude BETWEEN ? AND ? AND longitude BETWEEN ? AND ?");
        values.extend([
            Value::Real(bbox.south),
            Value::Real(bbox.north),
            Value::Real(bbox.west),
            Value::Real(bbox.east),
        ]);
    }
    sql.push_str(" ORDER BY julianday(occurred_at) DESC, id DESC");

    (sql, values)
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

struct SubscriptionRow {
    id: i64,
    owner_id: String,
    name: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
    location_label: Option<String>,
    radius_km: Option<f64>,
    categories: Option<String>,
    severities: Option<String>,
    channels: Option<String>,
    cadence: String,
    active: bool,
    created_at: Option<String>,
    updated_at: Option<String>,
}

impl SubscriptionRow {
    fn into_subscription(self) -> Result<Subscription> {
        let id = self.id;
        let malformed = |reason: String| AppError::MalformedSubscription { id, reason };

        let center = match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Coordinates::new(latitude, longitude),
            _ => return Err(malformed("missing watch-zone center".to_string())),
        };
        let cadence = self.cadence.parse::<CadenceTier>().map_err(malformed)?;

        let categories: BTreeSet<String> = parse_json_list(self.categories.as_deref())
            .map_err(|e| malformed(format!("categories: {}", e)))?
            .unwrap_or_default();
        let severities = parse_json_list::<Vec<String>>(self.severities.as_deref())
            .map_err(|e| malformed(format!("severities: {}", e)))?
            .unwrap_or_default()
            .iter()
            .map(|s| s.parse::<Severity>())
            .collect::<std::result::Result<BTreeSet<_>, _>>()
            .map_err(malformed)?;
        let channels = match parse_json_list::<Vec<String>>(self.channels.as_deref())
            .map_err(|e| malformed(format!("channels: {}", e)))?
        {
            Some(list) => list
                .iter()
                .map(|s| s.parse::<ChannelKind>())
                .collect::<std::result::Result<BTreeSet<_>, _>>()
                .map_err(malformed)?,
            None => BTreeSet::from([ChannelKind::Email]),
        };

        Ok(Subscription {
            id,
            owner_id: self.owner_id,
            name: self.name,
            center,
            location_label: self.location_label,
            radius_km: self.radius_km.unwrap_or(DEFAULT_RADIUS_KM),
            categories,
            severities,
            channels,
            cadence,
            active: self.active,
            created_at: self
                .created_at
                .and_then(|s| parse_datetime(&s))
                .unwrap_or_else(Utc::now),
            updated_at: self
                .updated_at
                .and_then(|s| parse_datetime(&s))
                .unwrap_or_else(Utc::now),
        })
    }
}

fn parse_json_list<T>(raw: Option<&str>) -> serde_json::Result<Option<T>>
where
    T: serde::de::DeserializeOwned,
{
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => serde_json::from_str(s).map(Some),
        None => Ok(None),
    }
}

fn subscription_from_row(row: &Row) -> rusqlite::Result<SubscriptionRow> {
    Ok(SubscriptionRow {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        name: row.get(2)?,
        latitude: row.get(3)?,
        longitude: row.get(4)?,
        location_label: row.get(5)?,
        radius_km: row.get(6)?,
        categories: row.get(7)?,
        severities: row.get(8)?,
        channels: row.get(9)?,
        cadence: row.get(10)?,
        active: row.get::<_, i64>(11)? != 0,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

struct IncidentRow {
    id: i64,
    category: String,
    severity: String,
    description: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
    address: Option<String>,
    occurred_at: String,
}

impl IncidentRow {
    fn into_incident(self) -> std::result::Result<IncidentRecord, String> {
        let severity = self.severity.parse::<Severity>()?;
        let occurred_at = parse_datetime(&self.occurred_at)
            .ok_or_else(|| format!("unparseable occurrence time '{}'", self.occurred_at))?;
        let coordinates = match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(Coordinates::new(latitude, longitude)),
            _ => None,
        };

        Ok(IncidentRecord {
            id: self.id,
            category: self.category,
            severity,
            description: self.description,
            location: Location {
                coordinates,
                address: self.address,
            },
            occurred_at,
        })
    }
}

fn incident_from_row(row: &Row) -> rusqlite::Result<IncidentRow> {
    Ok(IncidentRow {
        id: row.get(0)?,
        category: row.get(1)?,
        severity: row.get(2)?,
        description: row.get(3)?,
        latitude: row.get(4)?,
        longitude: row.get(5)?,
        address: row.get(6)?,
        occurred_at: row.get(7)?,
    })
}

struct DeliveryRow {
    id: i64,
    subscription_id: i64,
    owner_id: String,
    tier: String,
    channels_succeeded: String,
    incident_count: i64,
    sent_at: String,
}

fn delivery_from_row(row: &Row) -> rusqlite::Result<DeliveryRow> {
    Ok(DeliveryRow {
        id: row.get(0)?,
        subscription_id: row.get(1)?,
        owner_id: row.get(2)?,
        tier: row.get(3)?,
        channels_succeeded: row.get(4)?,
        incident_count: row.get(5)?,
        sent_at: row.get(6)?,
    })
}

fn load_delivery_incidents(
    conn: &rusqlite::Connection,
    deliveries: &[DeliveryRow],
) -> rusqlite::Result<BTreeMap<i64, BTreeSet<i64>>> {
    let mut incidents: BTreeMap<i64, BTreeSet<i64>> = BTreeMap::new();
    let mut stmt =
        conn.prepare("SELECT incident_id FROM delivery_incidents WHERE delivery_id = ?1")?;
    for delivery in deliveries {
        let ids = stmt
            .query_map(params![delivery.id], |row| row.get::<_, i64>(0))?
            .collect::<std::result::Result<BTreeSet<_>, _>>()?;
        incidents.insert(delivery.id, ids);
    }
    Ok(incidents)
}

fn assemble_deliveries(
    (rows, mut incidents): (Vec<DeliveryRow>, BTreeMap<i64, BTreeSet<i64>>),
) -> Result<Vec<DeliveryRecord>> {
    rows.into_iter()
        .map(|row| -> Result<DeliveryRecord> {
            let tier = row
                .tier
                .parse::<CadenceTier>()
                .map_err(|e| anyhow::anyhow!("delivery {}: {}", row.id, e))?;
            let channels_succeeded: BTreeSet<ChannelKind> =
                serde_json::from_str(&row.channels_succeeded)?;
            let sent_at = parse_datetime(&row.sent_at).ok_or_else(|| {
                anyhow::anyhow!("delivery {} has unparseable sent_at '{}'", row.id, row.sent_at)
            })?;
            Ok(DeliveryRecord {
                id: row.id,
                subscription_id: row.subscription_id,
                owner_id: row.owner_id,
                tier,
                incident_ids: incidents.remove(&row.id).unwrap_or_default(),
                channels_succeeded,
                incident_count: row.incident_count.max(0) as usize,
                sent_at,
            })
        })
        .collect()
}
