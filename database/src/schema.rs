/// Tables for party-local and scheduler-side records.
///
/// Statuses and roles are stored as their wire strings.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS t_job (
    job_id              TEXT        NOT NULL,
    role                TEXT        NOT NULL,
    party_id            TEXT        NOT NULL,
    protocol            TEXT        NOT NULL DEFAULT 'fate',
    dag                 JSONB       NOT NULL,
    parties             JSONB       NOT NULL DEFAULT '[]',
    initiator_party_id  TEXT        NOT NULL,
    scheduler_party_id  TEXT        NOT NULL,
    status              TEXT        NOT NULL,
    status_code         INTEGER     NOT NULL DEFAULT 0,
    progress            INTEGER     NOT NULL DEFAULT 0,
    priority            INTEGER     NOT NULL DEFAULT 0,
    error_message       TEXT,
    create_time         TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    update_time         TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    start_time          TIMESTAMPTZ,
    end_time            TIMESTAMPTZ,
    elapsed             BIGINT,
    PRIMARY KEY (job_id, role, party_id)
);

CREATE INDEX IF NOT EXISTS idx_job_status ON t_job (status);

CREATE TABLE IF NOT EXISTS t_task (
    job_id        TEXT        NOT NULL,
    role          TEXT        NOT NULL,
    party_id      TEXT        NOT NULL,
    task_name     TEXT        NOT NULL,
    component     TEXT        NOT NULL,
    task_id       TEXT        NOT NULL,
    task_version  INTEGER     NOT NULL,
    status        TEXT        NOT NULL,
    party_status  TEXT        NOT NULL,
    parameters    JSONB       NOT NULL DEFAULT '{}',
    inputs        JSONB       NOT NULL DEFAULT '{}',
    conf          JSONB       NOT NULL DEFAULT '{}',
    dependencies  TEXT[]      NOT NULL DEFAULT '{}',
    worker_id     TEXT,
    run_pid       INTEGER,
    run_ip        TEXT,
    error_report  TEXT,
    create_time   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    update_time   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    start_time    TIMESTAMPTZ,
    end_time      TIMESTAMPTZ,
    elapsed       BIGINT,
    PRIMARY KEY (job_id, task_id, task_version, role, party_id)
);

CREATE INDEX IF NOT EXISTS idx_task_party_status ON t_task (party_id, party_status);

CREATE TABLE IF NOT EXISTS t_schedule_job (
    job_id              TEXT        PRIMARY KEY,
    protocol            TEXT        NOT NULL DEFAULT 'fate',
    dag                 JSONB       NOT NULL,
    parties             JSONB       NOT NULL DEFAULT '[]',
    initiator_party_id  TEXT        NOT NULL,
    scheduler_party_id  TEXT        NOT NULL,
    status              TEXT        NOT NULL,
    status_code         INTEGER     NOT NULL DEFAULT 0,
    progress            INTEGER     NOT NULL DEFAULT 0,
    priority            INTEGER     NOT NULL DEFAULT 0,
    schedule_signal     BOOLEAN     NOT NULL DEFAULT FALSE,
    schedule_time       TIMESTAMPTZ,
    cancel_signal       BOOLEAN     NOT NULL DEFAULT FALSE,
    cancel_time         TIMESTAMPTZ,
    stop_status         TEXT,
    rerun_signal        BOOLEAN     NOT NULL DEFAULT FALSE,
    rerun_tasks         TEXT[]      NOT NULL DEFAULT '{}',
    created_parties     TEXT[]      NOT NULL DEFAULT '{}',
    error_message       TEXT,
    create_time         TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    update_time         TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    start_time          TIMESTAMPTZ,
    end_time            TIMESTAMPTZ,
    elapsed             BIGINT
);

CREATE INDEX IF NOT EXISTS idx_schedule_job_status
    ON t_schedule_job (status, priority DESC, create_time ASC);

CREATE TABLE IF NOT EXISTS t_schedule_task (
    job_id        TEXT        NOT NULL,
    role          TEXT        NOT NULL,
    party_id      TEXT        NOT NULL,
    task_name     TEXT        NOT NULL,
    component     TEXT        NOT NULL,
    task_id       TEXT        NOT NULL,
    task_version  INTEGER     NOT NULL,
    status        TEXT        NOT NULL,
    auto_retries  INTEGER     NOT NULL DEFAULT 0,
    error_report  TEXT,
    create_time   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    update_time   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    start_time    TIMESTAMPTZ,
    end_time      TIMESTAMPTZ,
    elapsed       BIGINT,
    PRIMARY KEY (job_id, task_id, task_version, role, party_id)
);
"#;
