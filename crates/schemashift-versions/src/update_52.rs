//! Version 51 to 52.
//!
//! - `order` becomes `presentation_order` on the ordered entities
//! - `Context.status` becomes text and negative time-to-live values are clamped
//! - `attachment_url` field attributes become localized
//! - `User` gains `public_name`, `readonly` and the key material fields
//! - Encryption settings are reset for every tenant

use crate::fields::{
    blob, created, dict, flag, int, int_required, json, list, never, opt_text, text, text_or,
    unset, uuid,
};
use schemashift_core::catalog::{EntityDef, SchemaSnapshot};
use schemashift_core::migration::{
    EntityMigrator, EpilogueContext, MigrationStep, RowContext, RowOutcome, RunCache,
    TransformError,
};
use schemashift_core::storage::{Row, RowKey};
use schemashift_core::Value;
use tracing::debug;

/// Entities whose `order` field is renamed.
const ORDERED_ENTITIES: [&str; 5] = [
    "FieldOption",
    "ReceiverContext",
    "Step",
    "SubmissionStatus",
    "SubmissionSubStatus",
];

/// Schema at version 51.
pub fn snapshot_v51() -> SchemaSnapshot {
    SchemaSnapshot::new(51)
        .with_entity(EntityDef::new("Tenant", "id").with_fields([
            int_required("id"),
            flag("active", true),
            created("creation_date"),
            text_or("subdomain", ""),
        ]))
        .with_entity(
            EntityDef::with_composite_identity("Config", ["tid", "var_name"]).with_fields([
                int("tid", 1),
                text("var_name"),
                json("value"),
                unset("update_date"),
            ]),
        )
        .with_entity(
            EntityDef::with_composite_identity("EnabledLanguage", ["tid", "name"])
                .with_fields([int("tid", 1), text("name")]),
        )
        .with_entity(EntityDef::new("Context", "id").with_fields([
            uuid("id"),
            int("tid", 1),
            flag("show_steps_navigation_interface", true),
            flag("show_recipients_details", false),
            flag("allow_recipients_selection", false),
            int("maximum_selectable_receivers", 0),
            flag("select_all_receivers", true),
            flag("enable_comments", true),
            flag("enable_messages", false),
            flag("enable_two_way_comments", true),
            flag("enable_two_way_messages", true),
            flag("enable_attachments", true),
            flag("enable_rc_to_wb_files", false),
            int("tip_timetolive", 90),
            dict("name"),
            dict("description"),
            dict("recipients_clarification"),
            dict("status_page_message"),
            flag("show_receivers_in_alphabetical_order", true),
            int("score_threshold_high", 0),
            int("score_threshold_medium", 0),
            int("presentation_order", 0),
            text_or("questionnaire_id", "default"),
            opt_text("additional_questionnaire_id"),
            int("status", 2),
        ]))
        .with_entity(EntityDef::new("FieldAttr", "id").with_fields([
            uuid("id"),
            text("field_id"),
            text("name"),
            text("type"),
            dict("value"),
        ]))
        .with_entity(EntityDef::new("FieldOption", "id").with_fields([
            uuid("id"),
            text("field_id"),
            dict("label"),
            dict("hint1"),
            dict("hint2"),
            int("score_points", 0),
            int("score_type", 0),
            flag("block_submission", false),
            list("trigger_receiver"),
            int("order", 0),
        ]))
        .with_entity(
            EntityDef::with_composite_identity("InternalTipData", ["internaltip_id", "key"])
                .with_fields([
                    text("internaltip_id"),
                    text("key"),
                    created("creation_date"),
                    dict("value"),
                ]),
        )
        .with_entity(
            EntityDef::with_composite_identity("ReceiverContext", ["context_id", "receiver_id"])
                .with_fields([text("context_id"), text("receiver_id"), int("order", 0)]),
        )
        .with_entity(EntityDef::new("Step", "id").with_fields([
            uuid("id"),
            text("questionnaire_id"),
            dict("label"),
            dict("description"),
            int("order", 0),
            int("triggered_by_score", 0),
        ]))
        .with_entity(
            EntityDef::with_composite_identity("SubmissionStatus", ["id", "tid"]).with_fields([
                uuid("id"),
                int("tid", 1),
                dict("label"),
                flag("system_defined", false),
                int("tip_timetolive", 90),
                flag("tip_timetolive_override", false),
                list("receivers"),
                int("order", 0),
            ]),
        )
        .with_entity(
            EntityDef::with_composite_identity("SubmissionSubStatus", ["id", "tid"]).with_fields([
                uuid("id"),
                int("tid", 1),
                text("submissionstatus_id"),
                dict("label"),
                int("tip_timetolive", 90),
                flag("tip_timetolive_override", false),
                list("receivers"),
                int("order", 0),
            ]),
        )
        .with_entity(EntityDef::new("User", "id").with_fields([
            uuid("id"),
            int("tid", 1),
            created("creation_date"),
            text_or("username", ""),
            text("salt"),
            text_or("hash_alg", "ARGON2"),
            text_or("password", ""),
            text_or("name", ""),
            dict("description"),
            text_or("role", "receiver"),
            text_or("state", "enabled"),
            unset("last_login"),
            text_or("mail_address", ""),
            text("language"),
            flag("password_change_needed", true),
            unset("password_change_date"),
            text_or("change_email_address", ""),
            opt_text("change_email_token"),
            unset("change_email_date"),
            opt_text("reset_password_token"),
            never("reset_password_date"),
            flag("notification", true),
            text_or("recipient_configuration", "default"),
            flag("can_delete_submission", false),
            flag("can_postpone_expiration", false),
            flag("can_grant_permissions", false),
            flag("can_edit_general_settings", false),
            flag("two_factor_enable", false),
            blob("two_factor_secret"),
            text_or("pgp_key_fingerprint", ""),
            text_or("pgp_key_public", ""),
            unset("pgp_key_expiration"),
        ]))
}

/// Schema at version 52.
pub fn snapshot_v52() -> SchemaSnapshot {
    SchemaSnapshot::new(52)
        .with_entity(EntityDef::new("Tenant", "id").with_fields([
            int_required("id"),
            flag("active", true),
            created("creation_date"),
            text_or("subdomain", ""),
        ]))
        .with_entity(
            EntityDef::with_composite_identity("Config", ["tid", "var_name"]).with_fields([
                int("tid", 1),
                text("var_name"),
                json("value"),
                unset("update_date"),
            ]),
        )
        .with_entity(
            EntityDef::with_composite_identity("EnabledLanguage", ["tid", "name"])
                .with_fields([int("tid", 1), text("name")]),
        )
        .with_entity(EntityDef::new("Context", "id").with_fields([
            uuid("id"),
            int("tid", 1),
            flag("show_steps_navigation_interface", true),
            flag("show_recipients_details", false),
            flag("allow_recipients_selection", false),
            int("maximum_selectable_receivers", 0),
            flag("select_all_receivers", true),
            flag("enable_comments", true),
            flag("enable_messages", false),
            flag("enable_two_way_comments", true),
            flag("enable_two_way_messages", true),
            flag("enable_attachments", true),
            flag("enable_rc_to_wb_files", false),
            int("tip_timetolive", 90),
            dict("name"),
            dict("description"),
            dict("recipients_clarification"),
            dict("status_page_message"),
            flag("show_receivers_in_alphabetical_order", true),
            int("score_threshold_high", 0),
            int("score_threshold_medium", 0),
            int("presentation_order", 0),
            text_or("questionnaire_id", "default"),
            opt_text("additional_questionnaire_id"),
            text_or("status", "disabled"),
        ]))
        .with_entity(EntityDef::new("FieldAttr", "id").with_fields([
            uuid("id"),
            text("field_id"),
            text("name"),
            text("type"),
            dict("value"),
        ]))
        .with_entity(EntityDef::new("FieldOption", "id").with_fields([
            uuid("id"),
            text("field_id"),
            dict("label"),
            dict("hint1"),
            dict("hint2"),
            int("score_points", 0),
            int("score_type", 0),
            flag("block_submission", false),
            list("trigger_receiver"),
            int("presentation_order", 0),
        ]))
        .with_entity(
            EntityDef::with_composite_identity("InternalTipData", ["internaltip_id", "key"])
                .with_fields([
                    text("internaltip_id"),
                    text("key"),
                    created("creation_date"),
                    dict("value"),
                ]),
        )
        .with_entity(
            EntityDef::with_composite_identity("ReceiverContext", ["context_id", "receiver_id"])
                .with_fields([text("context_id"), text("receiver_id"), int("presentation_order", 0)]),
        )
        .with_entity(EntityDef::new("Step", "id").with_fields([
            uuid("id"),
            text("questionnaire_id"),
            dict("label"),
            dict("description"),
            int("presentation_order", 0),
            int("triggered_by_score", 0),
        ]))
        .with_entity(
            EntityDef::with_composite_identity("SubmissionStatus", ["id", "tid"]).with_fields([
                uuid("id"),
                int("tid", 1),
                dict("label"),
                flag("system_defined", false),
                int("tip_timetolive", 90),
                flag("tip_timetolive_override", false),
                list("receivers"),
                int("presentation_order", 0),
            ]),
        )
        .with_entity(
            EntityDef::with_composite_identity("SubmissionSubStatus", ["id", "tid"]).with_fields([
                uuid("id"),
                int("tid", 1),
                text("submissionstatus_id"),
                dict("label"),
                int("tip_timetolive", 90),
                flag("tip_timetolive_override", false),
                list("receivers"),
                int("presentation_order", 0),
            ]),
        )
        .with_entity(EntityDef::new("User", "id").with_fields([
            uuid("id"),
            int("tid", 1),
            created("creation_date"),
            text_or("username", ""),
            text("salt"),
            text_or("hash_alg", "ARGON2"),
            text_or("password", ""),
            text_or("name", ""),
            text_or("public_name", ""),
            flag("readonly", false),
            text_or("crypto_prv_key", ""),
            text_or("crypto_pub_key", ""),
            text_or("crypto_rec_key", ""),
            text_or("crypto_bkp_key", ""),
            text_or("crypto_escrow_prv_key", ""),
            text_or("crypto_escrow_bkp1_key", ""),
            text_or("crypto_escrow_bkp2_key", ""),
            dict("description"),
            text_or("role", "receiver"),
            text_or("state", "enabled"),
            unset("last_login"),
            text_or("mail_address", ""),
            text("language"),
            flag("password_change_needed", true),
            unset("password_change_date"),
            text_or("change_email_address", ""),
            opt_text("change_email_token"),
            unset("change_email_date"),
            opt_text("reset_password_token"),
            never("reset_password_date"),
            flag("notification", true),
            text_or("recipient_configuration", "default"),
            flag("can_delete_submission", false),
            flag("can_postpone_expiration", false),
            flag("can_grant_permissions", false),
            flag("can_edit_general_settings", false),
            flag("two_factor_enable", false),
            blob("two_factor_secret"),
            text_or("pgp_key_fingerprint", ""),
            text_or("pgp_key_public", ""),
            unset("pgp_key_expiration"),
        ]))
}

/// The 51 to 52 step.
pub fn step() -> MigrationStep {
    let mut step = MigrationStep::new(snapshot_v51(), snapshot_v52());
    for entity in ORDERED_ENTITIES {
        step = step.rename(entity, "order", "presentation_order");
    }
    step.migrator(
        EntityMigrator::new("Context")
            .derive("status", context_status)
            .derive("tip_timetolive", |ctx| {
                let ttl = ctx.field("tip_timetolive")?.as_i64().unwrap_or(0);
                Ok(Value::Int(ttl.max(0)))
            }),
    )
    .migrator(EntityMigrator::new("FieldAttr").on_row(localize_attachment_url))
    .migrator(
        EntityMigrator::new("User")
            .derive("public_name", public_name)
            .derive("password", |ctx| {
                let password = ctx.field("password")?.as_str().unwrap_or_default();
                Ok(Value::from(strip_bytes_literal(password)))
            })
            .constant("two_factor_secret", Vec::<u8>::new()),
    )
    .epilogue(reset_encryption)
}

fn context_status(ctx: &RowContext<'_>) -> Result<Value, TransformError> {
    let status = match ctx.field("status")?.as_i64() {
        Some(0) => "disabled",
        Some(1) => "enabled",
        _ => "hidden",
    };
    Ok(Value::from(status))
}

/// `attachment_url` values are repeated for every enabled language.
fn localize_attachment_url(
    ctx: &RowContext<'_>,
    row: &mut Row,
    _cache: &mut RunCache,
) -> Result<RowOutcome, TransformError> {
    if row.str("name") != Some("attachment_url") {
        return Ok(RowOutcome::Write);
    }

    let value = row
        .get("value")
        .and_then(Value::as_json)
        .cloned()
        .unwrap_or(serde_json::Value::Null);
    let mut localized = serde_json::Map::new();
    for language in ctx.scan_old("EnabledLanguage")? {
        if let Some(name) = language.str("name") {
            localized.insert(name.to_string(), value.clone());
        }
    }

    row.set("type", "localized");
    row.set("value", serde_json::Value::Object(localized));
    Ok(RowOutcome::Write)
}

fn root_config(ctx: &RowContext<'_>, var_name: &str) -> Result<Option<Value>, TransformError> {
    let key = RowKey::new(vec![Value::Int(1), Value::from(var_name)]);
    Ok(ctx
        .lookup_old("Config", &key)?
        .and_then(|row| row.get("value").cloned()))
}

/// The platform name when user names are hidden, else the user's own name.
fn public_name(ctx: &RowContext<'_>) -> Result<Value, TransformError> {
    let own = ctx.field("name")?.clone();
    let hidden = root_config(ctx, "do_not_expose_users_names")?
        .and_then(|value| value.as_json().and_then(serde_json::Value::as_bool))
        .unwrap_or(false);
    if !hidden {
        return Ok(own);
    }

    Ok(root_config(ctx, "name")?
        .and_then(|value| value.as_json().and_then(|json| json.as_str().map(str::to_string)))
        .map(Value::from)
        .unwrap_or(own))
}

/// Undo the `b'...'` wrapping some passwords were stored with.
fn strip_bytes_literal(password: &str) -> &str {
    password
        .strip_prefix("b'")
        .and_then(|rest| rest.strip_suffix('\''))
        .unwrap_or(password)
}

fn config_row(tid: &Value, var_name: &str, value: bool, now: i64) -> Row {
    Row::new()
        .with("tid", tid.clone())
        .with("var_name", var_name)
        .with("value", serde_json::Value::Bool(value))
        .with("update_date", Value::Timestamp(now))
}

fn reset_encryption(ctx: &mut EpilogueContext<'_>) -> Result<(), TransformError> {
    let now = ctx.now();

    let mut removed = 0usize;
    for row in ctx.scan_new("Config")? {
        if row.str("var_name") != Some("encryption") {
            continue;
        }
        let tid = row.get("tid").cloned().unwrap_or(Value::Int(1));
        if ctx.remove("Config", &RowKey::new(vec![tid, Value::from("encryption")]))? {
            removed += 1;
        }
    }

    let mut unwrapped = 0usize;
    for mut row in ctx.scan_new("InternalTipData")? {
        if row.str("key") != Some("whistleblower_identity") {
            continue;
        }
        let inner = match row.get("value").and_then(Value::as_json) {
            Some(serde_json::Value::Array(items)) if items.len() == 1 => items[0].clone(),
            _ => continue,
        };
        row.set("value", inner);
        if ctx.replace("InternalTipData", row)? {
            unwrapped += 1;
        }
    }

    for tenant in ctx.scan_new("Tenant")? {
        let tid = tenant
            .get("id")
            .cloned()
            .ok_or_else(|| TransformError::MissingField("id".to_string()))?;
        ctx.insert("Config", config_row(&tid, "encryption", false, now))?;
        for (var_name, value) in [("escrow", false), ("enable_private_labels", true)] {
            let row = config_row(&tid, var_name, value, now);
            if !ctx.replace("Config", row.clone())? {
                ctx.insert("Config", row)?;
            }
        }
    }

    debug!(removed, unwrapped, "reset encryption settings");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use schemashift_core::catalog::ScalarType;

    #[test]
    fn test_step_is_valid() {
        let step = step();
        step.validate().unwrap();
        assert_eq!((step.from_version(), step.to_version()), (51, 52));
    }

    #[test]
    fn test_order_renames() {
        let step = step();
        for entity in ORDERED_ENTITIES {
            let renames = step.renames_for(entity);
            assert_eq!(
                renames.get("presentation_order").map(String::as_str),
                Some("order"),
                "{}",
                entity
            );
        }
    }

    #[test]
    fn test_strip_bytes_literal() {
        assert_eq!(strip_bytes_literal("b'abc'"), "abc");
        assert_eq!(strip_bytes_literal("abc"), "abc");
        assert_eq!(strip_bytes_literal("b'abc"), "b'abc");
        assert_eq!(strip_bytes_literal("b''"), "");
    }

    #[test]
    fn test_user_gains_key_fields() {
        let v52 = snapshot_v52();
        let user = v52.get_entity("User").unwrap();
        assert!(user.has_field("public_name"));
        assert!(user.has_field("readonly"));
        for field in [
            "crypto_prv_key",
            "crypto_pub_key",
            "crypto_rec_key",
            "crypto_bkp_key",
            "crypto_escrow_prv_key",
            "crypto_escrow_bkp1_key",
            "crypto_escrow_bkp2_key",
        ] {
            assert!(user.has_field(field), "{}", field);
        }
        assert!(!snapshot_v51().get_entity("User").unwrap().has_field("readonly"));
    }

    #[test]
    fn test_snapshots_declare_their_own_shapes() {
        let (v51, v52) = (snapshot_v51(), snapshot_v52());
        for entity in ORDERED_ENTITIES {
            let old = v51.get_entity(entity).unwrap();
            let new = v52.get_entity(entity).unwrap();
            assert!(old.has_field("order") && !old.has_field("presentation_order"));
            assert!(new.has_field("presentation_order") && !new.has_field("order"));
        }

        let status = |snapshot: &SchemaSnapshot| {
            snapshot.get_entity("Context").unwrap().get_field("status").unwrap().scalar
        };
        assert_eq!(status(&v51), ScalarType::Int);
        assert_eq!(status(&v52), ScalarType::String);
    }
}
