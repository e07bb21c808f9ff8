//! Tenant lifecycle handlers: install, uninstall, plan change, and user
//! provisioning.

use std::collections::HashMap;

use crate::db::{AppUserRow, SyncDb, TenantInstall};
use crate::envelope::CanonicalEvent;
use crate::error::ProcessingError;
use crate::hooks::SideEffect;
use crate::types::rfc3339;

use super::{first_str, require_first_str, stamp, Handler};

/// Setup tokens expire after three days; a stale welcome link forces the
/// user through the re-invite path instead.
const SETUP_TOKEN_TTL_HOURS: i64 = 72;

pub(super) fn register(handlers: &mut HashMap<&'static str, Handler>) {
    handlers.insert("AppInstall", handle_install);
    handlers.insert("AppUninstall", handle_uninstall);
    handlers.insert("PlanChange", handle_plan_change);
    handlers.insert("UserCreate", handle_user_create);
}

/// Install, per-location or per-company. Re-installing an uninstalled tenant
/// revives it.
fn handle_install(
    db: &SyncDb,
    event: &CanonicalEvent,
) -> Result<Vec<SideEffect>, ProcessingError> {
    let company_id = first_str(event, &["companyId"]).map(str::to_string);
    let install_kind = match first_str(event, &["installType"]) {
        Some(kind) => kind.to_string(),
        // Company-level installs carry a companyId and no locationId
        None if company_id.is_some() && event.str_field("locationId").is_none() => {
            "company".to_string()
        }
        None => "location".to_string(),
    };

    db.upsert_tenant_install(
        &TenantInstall {
            tenant_id: event.tenant_id.clone(),
            company_id,
            install_kind,
            plan: first_str(event, &["planId", "plan"]).map(str::to_string),
        },
        &stamp(event, "critical.install"),
    )?;

    log::info!("Critical: installed tenant {}", event.tenant_id);
    Ok(Vec::new())
}

/// Uninstall cascade: tenant marked uninstalled, credentials and setup
/// tokens revoked, users flagged for re-auth. Projected entity data is
/// retained for a potential re-install.
fn handle_uninstall(
    db: &SyncDb,
    event: &CanonicalEvent,
) -> Result<Vec<SideEffect>, ProcessingError> {
    db.mark_tenant_uninstalled(&event.tenant_id, &stamp(event, "critical.uninstall"))?;

    log::info!("Critical: uninstalled tenant {}", event.tenant_id);
    Ok(vec![SideEffect::ReauthRequired {
        tenant_id: event.tenant_id.clone(),
    }])
}

fn handle_plan_change(
    db: &SyncDb,
    event: &CanonicalEvent,
) -> Result<Vec<SideEffect>, ProcessingError> {
    let plan = require_first_str(event, &["planId", "plan", "newPlan"])?;

    db.update_tenant_plan(&event.tenant_id, plan, &stamp(event, "critical.plan_change"))?;

    log::info!("Critical: tenant {} moved to plan {}", event.tenant_id, plan);
    Ok(Vec::new())
}

/// Provision a local user and a time-limited setup token. The welcome
/// notification is returned as a side effect so its delivery can never fail
/// the provisioning write.
fn handle_user_create(
    db: &SyncDb,
    event: &CanonicalEvent,
) -> Result<Vec<SideEffect>, ProcessingError> {
    let user_id = require_first_str(event, &["_id", "id", "userId"])?.to_string();
    let email = event.require_str("email")?.to_string();

    let stamp = stamp(event, "critical.user_create");
    db.upsert_app_user(
        &AppUserRow {
            external_id: user_id.clone(),
            tenant_id: event.tenant_id.clone(),
            name: first_str(event, &["name", "firstName"]).map(str::to_string),
            email: Some(email.clone()),
            role: first_str(event, &["role"]).map(str::to_string),
        },
        &stamp,
    )?;

    let token = uuid::Uuid::new_v4().to_string();
    let expires_at = rfc3339(chrono::Utc::now() + chrono::Duration::hours(SETUP_TOKEN_TTL_HOURS));
    db.insert_user_setup_token(&token, &user_id, &event.tenant_id, &expires_at, &stamp.at)?;

    log::info!(
        "Critical: provisioned user {} for tenant {}",
        user_id,
        event.tenant_id
    );
    Ok(vec![SideEffect::WelcomeNotification {
        tenant_id: event.tenant_id.clone(),
        user_id,
        email,
        setup_token: token,
    }])
}
