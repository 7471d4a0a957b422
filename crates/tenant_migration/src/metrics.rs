use metrics::{
    register_counter,
    register_histogram,
};

register_counter!(
    pub MIGRATION_BLOCKED_WRITES_TOTAL,
    "Writes that hit a tenant migration blocker in a blocking state"
);
register_counter!(
    pub MIGRATION_BLOCKED_READS_TOTAL,
    "Reads that waited on a tenant migration blocker"
);
register_counter!(
    pub MIGRATION_REDIRECTED_OPS_TOTAL,
    "Operations rejected with a redirect to the recipient"
);
register_counter!(
    pub MIGRATIONS_BLOCKING_TOTAL,
    "Tenant migrations that entered a blocking state on this donor"
);
register_counter!(
    pub MIGRATIONS_COMMITTED_TOTAL,
    "Tenant migrations that reached the reject state on this donor"
);
register_counter!(
    pub MIGRATIONS_ABORTED_TOTAL,
    "Tenant migrations that aborted on this donor"
);
register_histogram!(
    pub MIGRATION_MAJORITY_WAIT_SECONDS,
    "Time spent waiting for a migration decision op-time to majority-commit",
    metrics::STATUS_LABEL
);

pub fn log_blocked_write() {
    MIGRATION_BLOCKED_WRITES_TOTAL.inc();
}

pub fn log_blocked_read() {
    MIGRATION_BLOCKED_READS_TOTAL.inc();
}

pub fn log_redirected_op() {
    MIGRATION_REDIRECTED_OPS_TOTAL.inc();
}

pub fn log_migration_blocking() {
    MIGRATIONS_BLOCKING_TOTAL.inc();
}

pub fn log_migration_committed() {
    MIGRATIONS_COMMITTED_TOTAL.inc();
}

pub fn log_migration_aborted() {
    MIGRATIONS_ABORTED_TOTAL.inc();
}
