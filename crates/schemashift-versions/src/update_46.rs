//! Version 45 to 46.
//!
//! - `Config` and `ConfigL10N` lose `customized` and gain `update_date`
//! - `Context.show_context` becomes the integer `status`
//! - `FieldOption` gains `score_type`; `Field` loses `editable`
//! - Colliding `InternalTip.progressive` values are reassigned per tenant
//! - Duplicate file names in `InternalFile` and `WhistleblowerFile` are dropped
//! - `Receiver` is folded into `User`
//! - The authenticated IP filter is split into one filter per role

use crate::fields::{
    created, dict, flag, int, int_required, json, never, opt_text, text, text_or, timestamp,
    unset, uuid,
};
use schemashift_core::catalog::{EntityDef, SchemaSnapshot};
use schemashift_core::migration::{
    EntityMigrator, EpilogueContext, MigrationStep, RowContext, RowOutcome, RunCache,
    TransformError,
};
use schemashift_core::storage::{Row, RowKey};
use schemashift_core::{Value, TIMESTAMP_NEVER};
use serde_json::json;
use tracing::debug;

/// `Context.status` of a context shown to whistleblowers.
pub const CONTEXT_ENABLED: i64 = 1;

/// `Context.status` of a hidden context.
pub const CONTEXT_HIDDEN: i64 = 2;

/// Roles that get their own IP filter.
const IP_FILTER_ROLES: [&str; 3] = ["admin", "custodian", "receiver"];

/// Schema at version 45.
pub fn snapshot_v45() -> SchemaSnapshot {
    SchemaSnapshot::new(45)
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
                flag("customized", false),
            ]),
        )
        .with_entity(
            EntityDef::with_composite_identity("ConfigL10N", ["tid", "lang", "var_name"])
                .with_fields([
                    int("tid", 1),
                    text("lang"),
                    text("var_name"),
                    opt_text("value"),
                    flag("customized", false),
                ]),
        )
        .with_entity(EntityDef::new("User", "id").with_fields([
            uuid("id"),
            int("tid", 1),
            created("creation_date"),
            text_or("username", ""),
            text("salt"),
            text_or("hash_alg", "SCRYPT"),
            text_or("password", ""),
            text_or("name", ""),
            dict("description"),
            text_or("role", "receiver"),
            text_or("state", "enabled"),
            never("last_login"),
            text_or("mail_address", ""),
            text("language"),
            flag("password_change_needed", true),
            never("password_change_date"),
            text_or("change_email_address", ""),
            opt_text("change_email_token"),
            never("change_email_date"),
            opt_text("reset_password_token"),
            never("reset_password_date"),
            flag("notification", true),
            text_or("pgp_key_fingerprint", ""),
            text_or("pgp_key_public", ""),
            never("pgp_key_expiration"),
            flag("can_edit_general_settings", false),
        ]))
        .with_entity(EntityDef::new("Receiver", "id").with_fields([
            uuid("id"),
            text_or("configuration", "default"),
            flag("can_delete_submission", false),
            flag("can_postpone_expiration", false),
            flag("can_grant_permissions", false),
        ]))
        .with_entity(EntityDef::new("Context", "id").with_fields([
            uuid("id"),
            int("tid", 1),
            flag("show_steps_navigation_interface", true),
            flag("show_context", true),
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
            int("tip_timetolive", 30),
            dict("name"),
            dict("description"),
            dict("recipients_clarification"),
            dict("status_page_message"),
            flag("show_receivers_in_alphabetical_order", true),
            int("presentation_order", 0),
            text_or("questionnaire_id", "default"),
            opt_text("additional_questionnaire_id"),
        ]))
        .with_entity(EntityDef::new("Field", "id").with_fields([
            uuid("id"),
            int("tid", 1),
            int("x", 0),
            int("y", 0),
            int("width", 0),
            json("label"),
            json("description"),
            json("hint"),
            flag("required", false),
            flag("preview", false),
            flag("multi_entry", false),
            json("multi_entry_hint"),
            int("triggered_by_score", 0),
            opt_text("step_id"),
            opt_text("fieldgroup_id"),
            text_or("type", "inputbox"),
            text_or("instance", "instance"),
            flag("editable", true),
            opt_text("template_id"),
            opt_text("template_override_id"),
        ]))
        .with_entity(EntityDef::new("FieldOption", "id").with_fields([
            uuid("id"),
            text("field_id"),
            int("presentation_order", 0),
            json("label"),
            int("score_points", 0),
            opt_text("trigger_field"),
        ]))
        .with_entity(EntityDef::new("InternalTip", "id").with_fields([
            uuid("id"),
            int("tid", 1),
            created("creation_date"),
            created("update_date"),
            text("context_id"),
            json("preview"),
            int("progressive", 0),
            flag("https", false),
            int("total_score", 0),
            timestamp("expiration_date"),
            flag("enable_two_way_comments", true),
            flag("enable_two_way_messages", true),
            flag("enable_attachments", true),
            flag("enable_whistleblower_identity", false),
            opt_text("additional_questionnaire_id"),
            created("wb_last_access"),
            int("wb_access_counter", 0),
            opt_text("status"),
            opt_text("substatus"),
        ]))
        .with_entity(EntityDef::new("InternalFile", "id").with_fields([
            uuid("id"),
            created("creation_date"),
            text("internaltip_id"),
            text("name"),
            text("filename"),
            text("content_type"),
            int_required("size"),
            int("new", 1),
            int("submission", 0),
        ]))
        .with_entity(EntityDef::new("WhistleblowerFile", "id").with_fields([
            uuid("id"),
            text("receivertip_id"),
            text("name"),
            text("filename"),
            int_required("size"),
            text("content_type"),
            int("downloads", 0),
            created("creation_date"),
            unset("last_access"),
            text("description"),
            int("new", 1),
        ]))
}

/// Schema at version 46.
pub fn snapshot_v46() -> SchemaSnapshot {
    SchemaSnapshot::new(46)
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
            EntityDef::with_composite_identity("ConfigL10N", ["tid", "lang", "var_name"])
                .with_fields([
                    int("tid", 1),
                    text("lang"),
                    text("var_name"),
                    opt_text("value"),
                    unset("update_date"),
                ]),
        )
        .with_entity(EntityDef::new("User", "id").with_fields([
            uuid("id"),
            int("tid", 1),
            created("creation_date"),
            text_or("username", ""),
            text("salt"),
            text_or("hash_alg", "SCRYPT"),
            text_or("password", ""),
            text_or("name", ""),
            dict("description"),
            text_or("role", "receiver"),
            text_or("state", "enabled"),
            never("last_login"),
            text_or("mail_address", ""),
            text("language"),
            flag("password_change_needed", true),
            never("password_change_date"),
            text_or("change_email_address", ""),
            opt_text("change_email_token"),
            never("change_email_date"),
            opt_text("reset_password_token"),
            never("reset_password_date"),
            flag("notification", true),
            text_or("recipient_configuration", "default"),
            flag("can_delete_submission", false),
            flag("can_postpone_expiration", false),
            flag("can_grant_permissions", false),
            flag("can_edit_general_settings", false),
            text_or("pgp_key_fingerprint", ""),
            text_or("pgp_key_public", ""),
            never("pgp_key_expiration"),
        ]))
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
            int("tip_timetolive", 30),
            dict("name"),
            dict("description"),
            dict("recipients_clarification"),
            dict("status_page_message"),
            flag("show_receivers_in_alphabetical_order", true),
            int("presentation_order", 0),
            text_or("questionnaire_id", "default"),
            opt_text("additional_questionnaire_id"),
            int("status", CONTEXT_HIDDEN),
        ]))
        .with_entity(EntityDef::new("Field", "id").with_fields([
            uuid("id"),
            int("tid", 1),
            int("x", 0),
            int("y", 0),
            int("width", 0),
            json("label"),
            json("description"),
            json("hint"),
            flag("required", false),
            flag("preview", false),
            flag("multi_entry", false),
            json("multi_entry_hint"),
            int("triggered_by_score", 0),
            opt_text("step_id"),
            opt_text("fieldgroup_id"),
            text_or("type", "inputbox"),
            text_or("instance", "instance"),
            opt_text("template_id"),
            opt_text("template_override_id"),
        ]))
        .with_entity(EntityDef::new("FieldOption", "id").with_fields([
            uuid("id"),
            text("field_id"),
            int("presentation_order", 0),
            json("label"),
            int("score_points", 0),
            int("score_type", 0),
            opt_text("trigger_field"),
        ]))
        .with_entity(EntityDef::new("InternalTip", "id").with_fields([
            uuid("id"),
            int("tid", 1),
            created("creation_date"),
            created("update_date"),
            text("context_id"),
            json("preview"),
            int("progressive", 0),
            flag("https", false),
            int("total_score", 0),
            timestamp("expiration_date"),
            flag("enable_two_way_comments", true),
            flag("enable_two_way_messages", true),
            flag("enable_attachments", true),
            flag("enable_whistleblower_identity", false),
            opt_text("additional_questionnaire_id"),
            created("wb_last_access"),
            int("wb_access_counter", 0),
            opt_text("status"),
            opt_text("substatus"),
        ]))
        .with_entity(EntityDef::new("InternalFile", "id").with_fields([
            uuid("id"),
            created("creation_date"),
            text("internaltip_id"),
            text("name"),
            text("filename"),
            text("content_type"),
            int_required("size"),
            int("new", 1),
            int("submission", 0),
        ]))
        .with_entity(EntityDef::new("WhistleblowerFile", "id").with_fields([
            uuid("id"),
            text("receivertip_id"),
            text("name"),
            text("filename"),
            int_required("size"),
            text("content_type"),
            int("downloads", 0),
            created("creation_date"),
            unset("last_access"),
            text("description"),
            int("new", 1),
        ]))
}

/// The 45 to 46 step.
pub fn step() -> MigrationStep {
    MigrationStep::new(snapshot_v45(), snapshot_v46())
        .migrator(EntityMigrator::new("Config").derive("update_date", update_date))
        .migrator(EntityMigrator::new("ConfigL10N").derive("update_date", update_date))
        .migrator(EntityMigrator::new("Context").derive("status", context_status))
        .migrator(EntityMigrator::new("FieldOption").derive("score_type", score_type))
        .migrator(EntityMigrator::new("InternalTip").on_row(reassign_progressive))
        .migrator(EntityMigrator::new("InternalFile").dedup_on(["filename"]))
        .migrator(EntityMigrator::new("WhistleblowerFile").dedup_on(["filename"]))
        .migrator(
            EntityMigrator::new("User")
                .derive("can_delete_submission", |ctx| receiver_value(ctx, "can_delete_submission"))
                .derive("can_grant_permissions", |ctx| receiver_value(ctx, "can_grant_permissions"))
                .derive("can_postpone_expiration", |ctx| {
                    receiver_value(ctx, "can_postpone_expiration")
                })
                .derive("recipient_configuration", |ctx| receiver_value(ctx, "configuration")),
        )
        .epilogue(split_ip_filters)
}

/// Customized values were touched now; untouched ones never were.
fn update_date(ctx: &RowContext<'_>) -> Result<Value, TransformError> {
    let customized = ctx
        .old()
        .get("customized")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    Ok(Value::Timestamp(if customized {
        ctx.now()
    } else {
        TIMESTAMP_NEVER
    }))
}

fn context_status(ctx: &RowContext<'_>) -> Result<Value, TransformError> {
    let shown = ctx.field("show_context")?.as_bool().unwrap_or(true);
    Ok(Value::Int(if shown { CONTEXT_ENABLED } else { CONTEXT_HIDDEN }))
}

fn score_type(ctx: &RowContext<'_>) -> Result<Value, TransformError> {
    let points = ctx.field("score_points")?.as_i64().unwrap_or(0);
    Ok(Value::Int(if points != 0 { 1 } else { 0 }))
}

/// Keep the first tip holding a progressive; later colliding tips of the same
/// tenant get the tenant's highest progressive plus one.
fn reassign_progressive(
    ctx: &RowContext<'_>,
    row: &mut Row,
    cache: &mut RunCache,
) -> Result<RowOutcome, TransformError> {
    let tid = row
        .int("tid")
        .ok_or_else(|| TransformError::MissingField("tid".to_string()))?;
    let progressive = row
        .int("progressive")
        .ok_or_else(|| TransformError::MissingField("progressive".to_string()))?;
    let scope = format!("InternalTip.progressive:{}", tid);

    if !cache.seen("InternalTip.progressive:reserved", tid.to_string()) {
        let highest = ctx
            .scan_old("InternalTip")?
            .iter()
            .filter(|tip| tip.int("tid") == Some(tid))
            .filter_map(|tip| tip.int("progressive"))
            .max();
        if let Some(highest) = highest {
            cache.sequence(&scope).reserve(highest);
        }
    }

    let assigned = cache.sequence(&scope).claim(progressive);
    if assigned != progressive {
        debug!(tid, from = progressive, to = assigned, "reassigned tip progressive");
        row.set("progressive", assigned);
    }
    Ok(RowOutcome::Write)
}

/// Receiver attribute of a user, or the field default when the user has no
/// receiver row.
fn receiver_value(ctx: &RowContext<'_>, field: &str) -> Result<Value, TransformError> {
    let key = RowKey::new(vec![ctx.field("id")?.clone()]);
    if let Some(value) = ctx
        .lookup_old("Receiver", &key)?
        .and_then(|receiver| receiver.get(field).cloned())
    {
        return Ok(value);
    }
    Ok(match field {
        "configuration" => Value::from("default"),
        _ => Value::Bool(false),
    })
}

fn config_key(tid: &Value, var_name: &str) -> RowKey {
    RowKey::new(vec![tid.clone(), Value::from(var_name)])
}

/// Split `ip_filter_authenticated[_enable]` into one setting per role.
fn split_ip_filters(ctx: &mut EpilogueContext<'_>) -> Result<(), TransformError> {
    let now = ctx.now();
    for tenant in ctx.scan_new("Tenant")? {
        let tid = tenant
            .get("id")
            .cloned()
            .ok_or_else(|| TransformError::MissingField("id".to_string()))?;

        let enabled = ctx.get_new("Config", &config_key(&tid, "ip_filter_authenticated_enable"))?;
        let filter = ctx.get_new("Config", &config_key(&tid, "ip_filter_authenticated"))?;
        if enabled.is_none() && filter.is_none() {
            continue;
        }

        let enabled = enabled
            .and_then(|row| row.get("value").cloned())
            .unwrap_or_else(|| Value::Json(json!(false)));
        let filter = filter
            .and_then(|row| row.get("value").cloned())
            .unwrap_or_else(|| Value::Json(json!("")));

        for role in IP_FILTER_ROLES {
            for (var_name, value) in [
                (format!("ip_filter_{}_enable", role), &enabled),
                (format!("ip_filter_{}", role), &filter),
            ] {
                ctx.insert(
                    "Config",
                    Row::new()
                        .with("tid", tid.clone())
                        .with("var_name", var_name)
                        .with("value", value.clone())
                        .with("update_date", Value::Timestamp(now)),
                )?;
            }
        }
        debug!(tid = %tid, "split authenticated ip filter per role");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_is_valid() {
        let step = step();
        step.validate().unwrap();
        assert_eq!((step.from_version(), step.to_version()), (45, 46));
    }

    #[test]
    fn test_receiver_is_folded_into_user() {
        assert!(snapshot_v45().has_entity("Receiver"));
        assert!(!snapshot_v46().has_entity("Receiver"));

        let user = snapshot_v46();
        let user = user.get_entity("User").unwrap();
        for field in [
            "can_delete_submission",
            "can_grant_permissions",
            "can_postpone_expiration",
            "recipient_configuration",
        ] {
            assert!(user.has_field(field), "{}", field);
        }
    }

    #[test]
    fn test_dropped_fields() {
        let v46 = snapshot_v46();
        assert!(!v46.get_entity("Context").unwrap().has_field("show_context"));
        assert!(!v46.get_entity("Field").unwrap().has_field("editable"));
        assert!(!v46.get_entity("Config").unwrap().has_field("customized"));
    }
}
