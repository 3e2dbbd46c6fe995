pub const SCHEMA: &str = r#"
-- Media records: one row per unique byte payload
CREATE TABLE IF NOT EXISTS media_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    exact_fingerprint TEXT NOT NULL UNIQUE,
    approx_fingerprint TEXT,            -- NULL for videos and undecodable stills
    media_kind TEXT NOT NULL,           -- 'picture' or 'video'
    size_bytes INTEGER NOT NULL,

    -- Locator: tier name plus a path relative to that tier's root.
    -- The relative path is identical in every tier, so a move only
    -- rewrites storage_tier.
    storage_tier TEXT NOT NULL DEFAULT 'hot',
    storage_path TEXT NOT NULL,

    group_id INTEGER,

    -- Reconciled capture metadata (denormalized for queries)
    capture_time TEXT,
    gps_latitude REAL,
    gps_longitude REAL,
    gps_accuracy_m REAL,
    gps_recorded_at TEXT,
    device_make TEXT,
    device_model TEXT,
    device_os_version TEXT,

    quality_score REAL,
    tombstoned INTEGER NOT NULL DEFAULT 0,

    -- Loop-prevention stamp of the last self-authored sidecar
    sidecar_stamp TEXT,
    sidecar_version INTEGER NOT NULL DEFAULT 0,

    first_seen_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    last_accessed_at TEXT,

    FOREIGN KEY (group_id) REFERENCES similarity_groups(id)
);

CREATE INDEX IF NOT EXISTS idx_records_exact ON media_records(exact_fingerprint);
CREATE INDEX IF NOT EXISTS idx_records_group ON media_records(group_id);
CREATE INDEX IF NOT EXISTS idx_records_tier ON media_records(storage_tier);
CREATE INDEX IF NOT EXISTS idx_records_capture ON media_records(capture_time);

-- Similarity groups: derivative families clustered by perceptual distance
CREATE TABLE IF NOT EXISTS similarity_groups (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

-- Which import sources have presented each record
CREATE TABLE IF NOT EXISTS source_tags (
    record_id INTEGER NOT NULL,
    source_id TEXT NOT NULL,
    original_path TEXT,                 -- Path as presented by that source
    tagged_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (record_id, source_id),
    FOREIGN KEY (record_id) REFERENCES media_records(id) ON DELETE CASCADE
);

-- Reconciled field set per record, with the winning source per field
CREATE TABLE IF NOT EXISTS merged_fields (
    record_id INTEGER NOT NULL,
    field_key TEXT NOT NULL,
    field_value TEXT NOT NULL,
    source_id TEXT NOT NULL,
    PRIMARY KEY (record_id, field_key),
    FOREIGN KEY (record_id) REFERENCES media_records(id) ON DELETE CASCADE
);

-- People: named individuals appearing in media
CREATE TABLE IF NOT EXISTS people (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    birthdate TEXT,
    verified INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_people_name ON people(name);

-- Person annotations: face regions, normalized 0..1 center + extent.
-- verifying_actor NULL means an unconfirmed classifier guess.
CREATE TABLE IF NOT EXISTS person_annotations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id INTEGER NOT NULL,
    person_id INTEGER NOT NULL,
    region_x REAL NOT NULL,
    region_y REAL NOT NULL,
    region_w REAL NOT NULL,
    region_h REAL NOT NULL,
    confidence REAL,
    verifying_actor TEXT,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (record_id) REFERENCES media_records(id) ON DELETE CASCADE,
    FOREIGN KEY (person_id) REFERENCES people(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_annotations_record ON person_annotations(record_id);
CREATE INDEX IF NOT EXISTS idx_annotations_person ON person_annotations(person_id);

-- Append-only processing history per record
CREATE TABLE IF NOT EXISTS processing_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id INTEGER NOT NULL,
    action TEXT NOT NULL,               -- 'ingested', 'merged', 'demoted', ...
    detail TEXT,
    source_id TEXT,
    occurred_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (record_id) REFERENCES media_records(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_history_record ON processing_history(record_id);
"#;

/// Best-effort column additions for databases created before the column
/// existed. Each statement fails harmlessly on an up-to-date schema.
pub const MIGRATIONS: &[&str] = &[
    "ALTER TABLE media_records ADD COLUMN gps_accuracy_m REAL",
    "ALTER TABLE media_records ADD COLUMN gps_recorded_at TEXT",
    "ALTER TABLE media_records ADD COLUMN device_os_version TEXT",
    "ALTER TABLE media_records ADD COLUMN sidecar_version INTEGER NOT NULL DEFAULT 0",
    "ALTER TABLE people ADD COLUMN birthdate TEXT",
    "ALTER TABLE source_tags ADD COLUMN original_path TEXT",
];
