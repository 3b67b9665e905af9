//! Relational schema
//!
//! All timestamps are unix milliseconds, all monetary columns integer cents.

/// Schema DDL, applied idempotently at startup
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS nodes (
    id                  TEXT PRIMARY KEY,
    host                TEXT NOT NULL,
    capacity_mb         INTEGER NOT NULL,
    used_mb             INTEGER NOT NULL DEFAULT 0,
    status              TEXT NOT NULL,
    last_heartbeat_at   INTEGER,
    agent_version       TEXT NOT NULL,
    secret_hash         TEXT,
    registered_at       INTEGER NOT NULL,
    updated_at          INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS bot_instances (
    id              TEXT PRIMARY KEY,
    tenant_id       TEXT NOT NULL,
    name            TEXT NOT NULL,
    node_id         TEXT,
    image           TEXT NOT NULL,
    env             TEXT NOT NULL DEFAULT '{}',
    billing_state   TEXT NOT NULL DEFAULT 'active',
    suspended_at    INTEGER,
    destroy_after   INTEGER,
    resource_tier   TEXT NOT NULL DEFAULT 'free',
    storage_tier    TEXT NOT NULL DEFAULT 'standard',
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL,
    UNIQUE (tenant_id, name)
);
CREATE INDEX IF NOT EXISTS idx_bot_instances_node ON bot_instances (node_id);
CREATE INDEX IF NOT EXISTS idx_bot_instances_tenant ON bot_instances (tenant_id);

CREATE TABLE IF NOT EXISTS credit_transactions (
    id                  TEXT PRIMARY KEY,
    tenant_id           TEXT NOT NULL,
    amount_cents        INTEGER NOT NULL,
    balance_after_cents INTEGER NOT NULL,
    tx_type             TEXT NOT NULL,
    description         TEXT NOT NULL,
    reference_id        TEXT,
    created_at          INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_credit_tx_reference
    ON credit_transactions (reference_id) WHERE reference_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_credit_tx_tenant ON credit_transactions (tenant_id);

CREATE TABLE IF NOT EXISTS credit_balances (
    tenant_id       TEXT PRIMARY KEY,
    balance_cents   INTEGER NOT NULL DEFAULT 0,
    updated_at      INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS meter_events (
    id              TEXT PRIMARY KEY,
    tenant_id       TEXT NOT NULL,
    cost_nanos      INTEGER NOT NULL,
    charge_nanos    INTEGER NOT NULL,
    capability      TEXT NOT NULL,
    provider        TEXT NOT NULL,
    created_at      INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_meter_events_tenant_time
    ON meter_events (tenant_id, created_at);

CREATE TABLE IF NOT EXISTS usage_summaries (
    tenant_id       TEXT NOT NULL,
    bucket_start    INTEGER NOT NULL,
    charge_nanos    INTEGER NOT NULL DEFAULT 0,
    cost_nanos      INTEGER NOT NULL DEFAULT 0,
    event_count     INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (tenant_id, bucket_start)
);

CREATE TABLE IF NOT EXISTS recovery_events (
    id              TEXT PRIMARY KEY,
    node_id         TEXT NOT NULL,
    trigger_kind    TEXT NOT NULL,
    status          TEXT NOT NULL,
    total           INTEGER NOT NULL DEFAULT 0,
    recovered       INTEGER NOT NULL DEFAULT 0,
    failed          INTEGER NOT NULL DEFAULT 0,
    waiting         INTEGER NOT NULL DEFAULT 0,
    started_at      INTEGER NOT NULL,
    completed_at    INTEGER,
    report          TEXT
);
CREATE INDEX IF NOT EXISTS idx_recovery_events_node ON recovery_events (node_id, status);

CREATE TABLE IF NOT EXISTS recovery_items (
    id                  TEXT PRIMARY KEY,
    recovery_event_id   TEXT NOT NULL REFERENCES recovery_events (id),
    tenant_id           TEXT NOT NULL,
    bot_id              TEXT NOT NULL,
    source_node         TEXT NOT NULL,
    target_node         TEXT,
    backup_key          TEXT NOT NULL,
    status              TEXT NOT NULL,
    reason              TEXT,
    created_at          INTEGER NOT NULL,
    updated_at          INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_recovery_items_event ON recovery_items (recovery_event_id);

CREATE TABLE IF NOT EXISTS snapshots (
    id              TEXT PRIMARY KEY,
    tenant_id       TEXT NOT NULL,
    instance_id     TEXT NOT NULL,
    kind            TEXT NOT NULL,
    storage_path    TEXT NOT NULL,
    remote_key      TEXT,
    size_bytes      INTEGER NOT NULL DEFAULT 0,
    created_at      INTEGER NOT NULL,
    expires_at      INTEGER,
    deleted_at      INTEGER
);
CREATE INDEX IF NOT EXISTS idx_snapshots_tenant ON snapshots (tenant_id);

CREATE TABLE IF NOT EXISTS bulk_undo_grants (
    operation_id    TEXT PRIMARY KEY,
    tenant_ids      TEXT NOT NULL,
    amount_cents    INTEGER NOT NULL,
    deadline        INTEGER NOT NULL,
    undo_status     TEXT NOT NULL DEFAULT 'not_undone',
    failed_ids      TEXT,
    created_at      INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS notification_queue (
    id          TEXT PRIMARY KEY,
    tenant_id   TEXT NOT NULL,
    kind        TEXT NOT NULL,
    body        TEXT NOT NULL,
    created_at  INTEGER NOT NULL,
    sent_at     INTEGER
);
CREATE INDEX IF NOT EXISTS idx_notification_queue_pending
    ON notification_queue (sent_at) WHERE sent_at IS NULL;

CREATE TABLE IF NOT EXISTS tenant_customers (
    tenant_id               TEXT PRIMARY KEY,
    processor_customer_id   TEXT,
    topup_enabled           INTEGER NOT NULL DEFAULT 0,
    topup_threshold_cents   INTEGER,
    topup_amount_cents      INTEGER,
    topup_failures          INTEGER NOT NULL DEFAULT 0,
    hourly_cap_cents        INTEGER,
    monthly_cap_cents       INTEGER,
    created_at              INTEGER NOT NULL,
    updated_at              INTEGER NOT NULL
);
"#;
