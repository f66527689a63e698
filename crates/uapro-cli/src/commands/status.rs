//! `uapro status`.

use std::io::{self, Write};

use serde_json::json;
use tracing::{error, warn};
use uapro_core::{ApplicationStatus, EntitlementSet, UaContext, UaError};

use super::{exit_codes, fail};

/// Print attachment, expiry, and per-service state.
pub fn run(ctx: &UaContext, json: bool) -> u8 {
    let mut stdout = io::stdout().lock();
    match render(ctx, json, &mut stdout) {
        Ok(()) => exit_codes::SUCCESS,
        Err(err) => {
            error!(err = %err, "status failed");
            fail(&err)
        },
    }
}

fn service_state(ctx: &UaContext, service: &str) -> &'static str {
    match ctx.entitlements.status(service) {
        Ok(ApplicationStatus::Enabled) => "enabled",
        Ok(ApplicationStatus::Disabled) => "disabled",
        Err(_) => "n/a",
    }
}

fn render(ctx: &UaContext, json: bool, out: &mut dyn Write) -> Result<(), UaError> {
    let Some(document) = ctx.attached_document()? else {
        if json {
            writeln!(out, "{}", json!({ "attached": false }))?;
        } else {
            writeln!(out, "This machine is not attached to a subscription.")?;
        }
        return Ok(());
    };

    let assessment = ctx.assess_expiry(&document);
    let in_progress = ctx
        .lock_manager()
        .holder()
        .inspect_err(|err| warn!(err = %err, "cannot read host lock"))
        .ok()
        .flatten();
    let entitlements: EntitlementSet = match ctx.system.release_info() {
        Ok(release) => document.entitlements_for_series(&release.series),
        Err(_) => document.entitlements(),
    };

    if json {
        let services: Vec<_> = entitlements
            .iter()
            .map(|record| {
                json!({
                    "name": record.service,
                    "entitled": record.entitled,
                    "status": service_state(ctx, &record.service),
                })
            })
            .collect();
        let value = json!({
            "attached": true,
            "contract_id": document.contract_id(),
            "effective_to": document.effective_to().map(|at| at.to_rfc3339()),
            "expiry": {
                "status": assessment.status,
                "days": assessment.days,
            },
            "services": services,
            "operation_in_progress": in_progress.as_ref().map(|holder| json!({
                "operation": holder.operation,
                "pid": holder.pid,
            })),
        });
        writeln!(out, "{value:#}")?;
        return Ok(());
    }

    writeln!(out, "Contract:     {}", document.contract_id())?;
    writeln!(
        out,
        "Expires:      {}",
        document
            .effective_to()
            .map_or_else(|| "never".to_string(), |at| at.format("%d %b %Y").to_string())
    )?;
    writeln!(out, "Expiry state: {} ({} days)", assessment.status, assessment.days)?;
    if let Some(holder) = &in_progress {
        writeln!(out, "Operation in progress: {} (pid:{})", holder.operation, holder.pid)?;
    }
    writeln!(out)?;
    writeln!(out, "{:<20} {:<9} STATUS", "SERVICE", "ENTITLED")?;
    for record in &entitlements {
        writeln!(
            out,
            "{:<20} {:<9} {}",
            record.service,
            if record.entitled { "yes" } else { "no" },
            service_state(ctx, &record.service)
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;

    use chrono::{DateTime, TimeDelta, Utc};
    use uapro_core::{
        EntitlementRecord, ManualClock, MemoryEntitlementBackend, MemoryTokenStore, MockContractClient,
        RecordingSystem, TokenDocument, UaConfig,
    };

    use super::*;

    fn context(dir: &Path, token: Option<TokenDocument>, backend: Arc<MemoryEntitlementBackend>) -> UaContext {
        let mut config = UaConfig::default();
        config.client.data_dir = dir.to_path_buf();
        let now = DateTime::parse_from_rfc3339("2026-10-17T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        UaContext::new(
            config,
            Arc::new(RecordingSystem::new().with_release("jammy", "22.04")),
            Arc::new(ManualClock::new(now)),
            Arc::new(MemoryTokenStore::new(token)),
            Arc::new(MockContractClient::new()),
            backend,
        )
    }

    fn attached_token() -> TokenDocument {
        let effective_to = DateTime::parse_from_rfc3339("2027-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        TokenDocument::new("tok", "cid-7")
            .with_effective_to(Some(effective_to))
            .with_entitlement(EntitlementRecord::new("esm-infra", true))
            .with_entitlement(EntitlementRecord::new("fips", false))
    }

    fn render_to_string(ctx: &UaContext, json: bool) -> String {
        let mut out = Vec::new();
        render(ctx, json, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_unattached() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), None, Arc::new(MemoryEntitlementBackend::new()));
        assert_eq!(
            render_to_string(&ctx, false),
            "This machine is not attached to a subscription.\n"
        );
        assert_eq!(render_to_string(&ctx, true), "{\"attached\":false}\n");
    }

    #[test]
    fn test_text_table() {
        let backend = Arc::new(MemoryEntitlementBackend::new());
        backend.set_status("esm-infra", ApplicationStatus::Enabled);
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), Some(attached_token()), backend);

        let text = render_to_string(&ctx, false);
        assert!(text.starts_with("Contract:     cid-7\nExpires:      01 Jan 2027\n"), "{text}");
        assert!(text.contains("Expiry state: active (76 days)"), "{text}");
        assert!(text.contains("esm-infra            yes       enabled\n"), "{text}");
        assert!(text.contains("fips                 no        disabled\n"), "{text}");
        assert!(!text.contains("Operation in progress"), "{text}");
    }

    #[test]
    fn test_reports_operation_in_progress() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), Some(attached_token()), Arc::new(MemoryEntitlementBackend::new()));
        fs::write(
            ctx.config.lock_path(),
            format!("{}:uapro refresh", std::process::id()),
        )
        .unwrap();

        let text = render_to_string(&ctx, false);
        assert!(
            text.contains(&format!("Operation in progress: uapro refresh (pid:{})", std::process::id())),
            "{text}"
        );
        let value: serde_json::Value = serde_json::from_str(&render_to_string(&ctx, true)).unwrap();
        assert_eq!(value["operation_in_progress"]["operation"], "uapro refresh");
    }

    #[test]
    fn test_json_output() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), Some(attached_token()), Arc::new(MemoryEntitlementBackend::new()));
        let value: serde_json::Value = serde_json::from_str(&render_to_string(&ctx, true)).unwrap();

        assert_eq!(value["attached"], true);
        assert_eq!(value["contract_id"], "cid-7");
        assert_eq!(value["expiry"]["status"], "active");
        assert_eq!(value["services"][0]["name"], "esm-infra");
        assert_eq!(value["services"][1]["entitled"], false);
        assert!(value["operation_in_progress"].is_null());
    }
}
