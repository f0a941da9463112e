//! Scenario tests for the built-in steps.

use schemashift_core::migration::{
    migrate, ConfigError, MigrationConfig, MigrationError, MigrationExecutor, MigrationReport,
};
use schemashift_core::storage::{Row, RowKey, SledLocation, SledStore, StorageConfig, Store, StoreLocation};
use schemashift_core::{Value, TIMESTAMP_NEVER};
use schemashift_versions::builtin_registry;
use serde_json::json;

struct TestContext {
    location: SledLocation,
    _dir: tempfile::TempDir,
}

impl TestContext {
    fn new(version: u32, seed: impl FnOnce(&SledStore)) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig::new(dir.path().join("store"));
        {
            let store = SledStore::open(&config).unwrap();
            seed(&store);
            store.set_version(version).unwrap();
            store.flush().unwrap();
        }
        Self {
            location: SledLocation::new(config),
            _dir: dir,
        }
    }

    fn execute(&self, target: u32) -> MigrationReport {
        let registry = builtin_registry().unwrap();
        MigrationExecutor::new(&self.location, &registry, MigrationConfig::default())
            .execute(target)
            .unwrap()
    }

    fn store(&self) -> SledStore {
        self.location.open_record().unwrap()
    }
}

fn key(values: &[Value]) -> RowKey {
    RowKey::new(values.to_vec())
}

fn id(value: &str) -> RowKey {
    key(&[Value::from(value)])
}

fn config_key(tid: i64, var_name: &str) -> RowKey {
    key(&[Value::Int(tid), Value::from(var_name)])
}

fn put(store: &SledStore, entity: &str, key: RowKey, row: Row) {
    store.insert(entity, &key, &row).unwrap();
}

fn get(store: &SledStore, entity: &str, key: &RowKey) -> Row {
    store
        .get(entity, key)
        .unwrap()
        .unwrap_or_else(|| panic!("{} {} not found", entity, key))
}

fn config(tid: i64, var_name: &str, value: serde_json::Value) -> Row {
    Row::new()
        .with("tid", tid)
        .with("var_name", var_name)
        .with("value", value)
}

// --- 45 -> 46 ---

fn seed_v45(store: &SledStore) {
    for tid in [1, 2] {
        put(store, "Tenant", key(&[Value::Int(tid)]), Row::new().with("id", tid));
    }

    put(
        store,
        "Config",
        config_key(1, "ip_filter_authenticated_enable"),
        config(1, "ip_filter_authenticated_enable", json!(true)).with("customized", false),
    );
    put(
        store,
        "Config",
        config_key(1, "ip_filter_authenticated"),
        config(1, "ip_filter_authenticated", json!("10.0.0.0/8")).with("customized", true),
    );
    put(
        store,
        "Config",
        config_key(2, "name"),
        config(2, "name", json!("second")).with("customized", false),
    );
    put(
        store,
        "ConfigL10N",
        key(&[Value::Int(1), Value::from("en"), Value::from("header_title")]),
        Row::new()
            .with("tid", 1)
            .with("lang", "en")
            .with("var_name", "header_title")
            .with("value", "Welcome")
            .with("customized", true),
    );

    put(
        store,
        "Receiver",
        id("r1"),
        Row::new()
            .with("id", "r1")
            .with("configuration", "forcefully_selected")
            .with("can_delete_submission", true),
    );
    for user in ["r1", "admin"] {
        put(
            store,
            "User",
            id(user),
            Row::new()
                .with("id", user)
                .with("salt", "c2FsdA==")
                .with("language", "en")
                .with("name", user),
        );
    }

    for (context, shown) in [("c1", true), ("c2", false)] {
        put(
            store,
            "Context",
            id(context),
            Row::new().with("id", context).with("show_context", shown),
        );
    }

    for (option, points) in [("o1", 3), ("o2", 0)] {
        put(
            store,
            "FieldOption",
            id(option),
            Row::new()
                .with("id", option)
                .with("field_id", "f1")
                .with("label", json!({"en": option}))
                .with("score_points", points),
        );
    }

    for (tip, tid, progressive) in [("t1", 1, 1), ("t2", 1, 1), ("t3", 1, 2), ("t4", 2, 1)] {
        put(
            store,
            "InternalTip",
            id(tip),
            Row::new()
                .with("id", tip)
                .with("tid", tid)
                .with("context_id", "c1")
                .with("preview", json!({}))
                .with("progressive", progressive)
                .with("expiration_date", Value::Timestamp(TIMESTAMP_NEVER)),
        );
    }

    for (file, filename) in [("i1", "x.pdf"), ("i2", "x.pdf"), ("i3", "y.pdf")] {
        put(
            store,
            "InternalFile",
            id(file),
            Row::new()
                .with("id", file)
                .with("internaltip_id", "t1")
                .with("name", filename)
                .with("filename", filename)
                .with("content_type", "application/pdf")
                .with("size", 10),
        );
    }
}

#[test]
fn test_46_context_status() {
    let ctx = TestContext::new(45, seed_v45);
    ctx.execute(46);

    let store = ctx.store();
    assert_eq!(store.version().unwrap(), Some(46));
    let shown = get(&store, "Context", &id("c1"));
    assert_eq!(shown.int("status"), Some(1));
    assert!(!shown.contains("show_context"));
    assert_eq!(get(&store, "Context", &id("c2")).int("status"), Some(2));
}

#[test]
fn test_46_config_update_date() {
    let ctx = TestContext::new(45, seed_v45);
    ctx.execute(46);

    let store = ctx.store();
    let untouched = get(&store, "Config", &config_key(2, "name"));
    assert_eq!(untouched.get("update_date"), Some(&Value::Timestamp(TIMESTAMP_NEVER)));
    assert!(!untouched.contains("customized"));

    let touched = get(&store, "Config", &config_key(1, "ip_filter_authenticated"));
    let stamp = touched.get("update_date").and_then(Value::as_timestamp).unwrap();
    assert!(stamp > 0 && stamp < TIMESTAMP_NEVER);

    let localized = get(
        &store,
        "ConfigL10N",
        &key(&[Value::Int(1), Value::from("en"), Value::from("header_title")]),
    );
    assert_ne!(localized.get("update_date"), Some(&Value::Timestamp(TIMESTAMP_NEVER)));
}

#[test]
fn test_46_file_dedup() {
    let ctx = TestContext::new(45, seed_v45);
    let report = ctx.execute(46);

    let tally = report.step(46).unwrap().tally("InternalFile");
    assert_eq!(tally.read, 3);
    assert_eq!(tally.processed, 2);
    assert_eq!(tally.skipped, 1);
    assert_eq!(tally.written, 2);

    let store = ctx.store();
    assert!(store.get("InternalFile", &id("i1")).unwrap().is_some());
    assert!(store.get("InternalFile", &id("i2")).unwrap().is_none());
    assert!(store.get("InternalFile", &id("i3")).unwrap().is_some());
}

#[test]
fn test_46_receiver_folded_into_user() {
    let ctx = TestContext::new(45, seed_v45);
    ctx.execute(46);

    let store = ctx.store();
    let receiver = get(&store, "User", &id("r1"));
    assert_eq!(receiver.bool("can_delete_submission"), Some(true));
    assert_eq!(receiver.bool("can_grant_permissions"), Some(false));
    assert_eq!(receiver.str("recipient_configuration"), Some("forcefully_selected"));

    let admin = get(&store, "User", &id("admin"));
    assert_eq!(admin.bool("can_delete_submission"), Some(false));
    assert_eq!(admin.str("recipient_configuration"), Some("default"));

    assert_eq!(store.count("Receiver").unwrap(), 0);
}

#[test]
fn test_46_progressive_reassignment() {
    let ctx = TestContext::new(45, seed_v45);
    ctx.execute(46);

    let store = ctx.store();
    let progressives: Vec<_> = ["t1", "t2", "t3", "t4"]
        .iter()
        .map(|tip| get(&store, "InternalTip", &id(tip)).int("progressive").unwrap())
        .collect();
    assert_eq!(progressives, vec![1, 3, 2, 1]);
}

#[test]
fn test_46_score_type() {
    let ctx = TestContext::new(45, seed_v45);
    ctx.execute(46);

    let store = ctx.store();
    assert_eq!(get(&store, "FieldOption", &id("o1")).int("score_type"), Some(1));
    assert_eq!(get(&store, "FieldOption", &id("o2")).int("score_type"), Some(0));
}

#[test]
fn test_46_ip_filter_split() {
    let ctx = TestContext::new(45, seed_v45);
    let report = ctx.execute(46);

    let tally = report.step(46).unwrap().tally("Config");
    assert_eq!(tally.inserted, 6);
    assert_eq!(tally.written, 9);

    let store = ctx.store();
    for role in ["admin", "custodian", "receiver"] {
        let enabled = get(&store, "Config", &config_key(1, &format!("ip_filter_{}_enable", role)));
        assert_eq!(enabled.get("value"), Some(&Value::Json(json!(true))));
        let filter = get(&store, "Config", &config_key(1, &format!("ip_filter_{}", role)));
        assert_eq!(filter.get("value"), Some(&Value::Json(json!("10.0.0.0/8"))));
        assert!(store
            .get("Config", &config_key(2, &format!("ip_filter_{}", role)))
            .unwrap()
            .is_none());
    }
}

#[test]
fn test_chain_across_missing_steps_leaves_store_untouched() {
    let ctx = TestContext::new(45, seed_v45);
    let before = ctx.location.digest().unwrap();

    let registry = builtin_registry().unwrap();
    let err = migrate(&ctx.location, &registry, 52).unwrap_err();
    assert!(matches!(
        err,
        MigrationError::Config(ConfigError::MissingStep { from: 46 })
    ));

    assert_eq!(ctx.location.digest().unwrap(), before);
    assert_eq!(ctx.store().version().unwrap(), Some(45));
}

// --- 51 -> 52 ---

fn seed_v51(hide_names: bool) -> impl FnOnce(&SledStore) {
    move |store| {
        for tid in [1, 2] {
            put(store, "Tenant", key(&[Value::Int(tid)]), Row::new().with("id", tid));
            put(
                store,
                "Config",
                config_key(tid, "encryption"),
                config(tid, "encryption", json!(true)),
            );
        }
        put(store, "Config", config_key(1, "name"), config(1, "name", json!("Platform")));
        put(store, "Config", config_key(1, "escrow"), config(1, "escrow", json!(true)));
        if hide_names {
            put(
                store,
                "Config",
                config_key(1, "do_not_expose_users_names"),
                config(1, "do_not_expose_users_names", json!(true)),
            );
        }

        for lang in ["en", "it"] {
            put(
                store,
                "EnabledLanguage",
                key(&[Value::Int(1), Value::from(lang)]),
                Row::new().with("tid", 1).with("name", lang),
            );
        }

        for (context, status, ttl) in [("c0", 0, -1), ("c1", 1, 30), ("c2", 2, 90)] {
            put(
                store,
                "Context",
                id(context),
                Row::new()
                    .with("id", context)
                    .with("status", status)
                    .with("tip_timetolive", ttl),
            );
        }

        put(
            store,
            "FieldAttr",
            id("a1"),
            Row::new()
                .with("id", "a1")
                .with("field_id", "f1")
                .with("name", "attachment_url")
                .with("type", "unicode")
                .with("value", json!("https://example.org/form.pdf")),
        );
        put(
            store,
            "FieldAttr",
            id("a2"),
            Row::new()
                .with("id", "a2")
                .with("field_id", "f1")
                .with("name", "min_len")
                .with("type", "int")
                .with("value", json!(3)),
        );

        put(
            store,
            "FieldOption",
            id("o1"),
            Row::new().with("id", "o1").with("field_id", "f1").with("order", 3),
        );
        put(
            store,
            "Step",
            id("s1"),
            Row::new().with("id", "s1").with("questionnaire_id", "default").with("order", 1),
        );

        for (tip, value) in [("tip1", json!([{"name": "Jane"}])), ("tip2", json!([1, 2]))] {
            put(
                store,
                "InternalTipData",
                key(&[Value::from(tip), Value::from("whistleblower_identity")]),
                Row::new()
                    .with("internaltip_id", tip)
                    .with("key", "whistleblower_identity")
                    .with("value", value),
            );
        }

        for (user, password) in [("u1", "b'secret'"), ("u2", "plain")] {
            put(
                store,
                "User",
                id(user),
                Row::new()
                    .with("id", user)
                    .with("name", format!("{} name", user))
                    .with("password", password)
                    .with("salt", "c2FsdA==")
                    .with("language", "en")
                    .with("two_factor_secret", b"legacy".to_vec()),
            );
        }
    }
}

#[test]
fn test_52_renames_order() {
    let ctx = TestContext::new(51, seed_v51(false));
    ctx.execute(52);

    let store = ctx.store();
    assert_eq!(store.version().unwrap(), Some(52));
    let option = get(&store, "FieldOption", &id("o1"));
    assert_eq!(option.int("presentation_order"), Some(3));
    assert!(!option.contains("order"));
    assert_eq!(get(&store, "Step", &id("s1")).int("presentation_order"), Some(1));
}

#[test]
fn test_52_context_status_text() {
    let ctx = TestContext::new(51, seed_v51(false));
    ctx.execute(52);

    let store = ctx.store();
    let disabled = get(&store, "Context", &id("c0"));
    assert_eq!(disabled.str("status"), Some("disabled"));
    assert_eq!(disabled.int("tip_timetolive"), Some(0));
    assert_eq!(get(&store, "Context", &id("c1")).str("status"), Some("enabled"));
    assert_eq!(get(&store, "Context", &id("c1")).int("tip_timetolive"), Some(30));
    assert_eq!(get(&store, "Context", &id("c2")).str("status"), Some("hidden"));
}

#[test]
fn test_52_attachment_url_localized() {
    let ctx = TestContext::new(51, seed_v51(false));
    ctx.execute(52);

    let store = ctx.store();
    let attachment = get(&store, "FieldAttr", &id("a1"));
    assert_eq!(attachment.str("type"), Some("localized"));
    assert_eq!(
        attachment.get("value"),
        Some(&Value::Json(json!({
            "en": "https://example.org/form.pdf",
            "it": "https://example.org/form.pdf",
        })))
    );

    let other = get(&store, "FieldAttr", &id("a2"));
    assert_eq!(other.str("type"), Some("int"));
    assert_eq!(other.get("value"), Some(&Value::Json(json!(3))));
}

#[test]
fn test_52_user_conversion() {
    let ctx = TestContext::new(51, seed_v51(true));
    ctx.execute(52);

    let store = ctx.store();
    let user = get(&store, "User", &id("u1"));
    assert_eq!(user.str("password"), Some("secret"));
    assert_eq!(user.str("public_name"), Some("Platform"));
    assert_eq!(user.get("two_factor_secret"), Some(&Value::Bytes(Vec::new())));
    assert_eq!(user.bool("readonly"), Some(false));
    assert_eq!(user.str("crypto_pub_key"), Some(""));
    assert_eq!(get(&store, "User", &id("u2")).str("password"), Some("plain"));
}

#[test]
fn test_52_public_name_exposed() {
    let ctx = TestContext::new(51, seed_v51(false));
    ctx.execute(52);

    let store = ctx.store();
    assert_eq!(get(&store, "User", &id("u1")).str("public_name"), Some("u1 name"));
}

#[test]
fn test_52_encryption_reset() {
    let ctx = TestContext::new(51, seed_v51(true));
    let report = ctx.execute(52);

    // 5 old rows, 2 encryption rows removed, 5 inserted, 1 escrow replaced.
    let tally = report.step(52).unwrap().tally("Config");
    assert_eq!(tally.read, 5);
    assert_eq!(tally.removed, 2);
    assert_eq!(tally.inserted, 5);
    assert_eq!(tally.written, 8);

    let store = ctx.store();
    for tid in [1, 2] {
        for (var_name, value) in [
            ("encryption", false),
            ("escrow", false),
            ("enable_private_labels", true),
        ] {
            let row = get(&store, "Config", &config_key(tid, var_name));
            assert_eq!(row.get("value"), Some(&Value::Json(json!(value))), "{} {}", tid, var_name);
        }
    }
}

#[test]
fn test_52_whistleblower_identity_unwrapped() {
    let ctx = TestContext::new(51, seed_v51(false));
    ctx.execute(52);

    let store = ctx.store();
    let single = get(
        &store,
        "InternalTipData",
        &key(&[Value::from("tip1"), Value::from("whistleblower_identity")]),
    );
    assert_eq!(single.get("value"), Some(&Value::Json(json!({"name": "Jane"}))));

    let many = get(
        &store,
        "InternalTipData",
        &key(&[Value::from("tip2"), Value::from("whistleblower_identity")]),
    );
    assert_eq!(many.get("value"), Some(&Value::Json(json!([1, 2]))));
}
