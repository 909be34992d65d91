pub const SCHEMA: &str = r#"
-- subscriptions table (written by the management API, read-only here)
CREATE TABLE IF NOT EXISTS subscriptions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id TEXT NOT NULL,
    name TEXT NOT NULL,
    latitude REAL,
    longitude REAL,
    location_label TEXT,
    radius_km REAL,
    categories TEXT NOT NULL DEFAULT '[]',
    severities TEXT NOT NULL DEFAULT '[]',
    channels TEXT,
    cadence TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_subscriptions_active_cadence ON subscriptions(active, cadence);

-- incidents table (written by ingestion, read-only here)
CREATE TABLE IF NOT EXISTS incidents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    category TEXT NOT NULL,
    severity TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    latitude REAL,
    longitude REAL,
    address TEXT,
    occurred_at TEXT NOT NULL,
    ingested_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_incidents_occurred_at ON incidents(occurred_at);
CREATE INDEX IF NOT EXISTS idx_incidents_lat_lng ON incidents(latitude, longitude);

-- contacts table (owner profile details used for recipient resolution)
CREATE TABLE IF NOT EXISTS contacts (
    owner_id TEXT PRIMARY KEY,
    email TEXT,
    phone TEXT,
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

-- deliveries table (append-only audit, source of truth for dedup)
CREATE TABLE IF NOT EXISTS deliveries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    subscription_id INTEGER NOT NULL,
    owner_id TEXT NOT NULL,
    tier TEXT NOT NULL,
    channels_succeeded TEXT NOT NULL,
    incident_count INTEGER NOT NULL,
    sent_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_deliveries_subscription_tier_sent ON deliveries(subscription_id, tier, sent_at);

-- delivery_incidents table (one row per incident covered by a delivery)
CREATE TABLE IF NOT EXISTS delivery_incidents (
    delivery_id INTEGER NOT NULL REFERENCES deliveries(id) ON DELETE CASCADE,
    subscription_id INTEGER NOT NULL,
    tier TEXT NOT NULL,
    incident_id INTEGER NOT NULL,
    sent_at TEXT NOT NULL,
    PRIMARY KEY (delivery_id, incident_id)
);

CREATE INDEX IF NOT EXISTS idx_delivery_incidents_coverage ON delivery_incidents(subscription_id, tier, incident_id, sent_at);
"#;
