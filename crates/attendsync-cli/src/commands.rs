//! One-shot subcommands.

use anyhow::{bail, Context, Result};
use tracing::debug;

use attendsync_core::auth::SessionData;
use attendsync_core::cache::CleanupReport;
use attendsync_core::capture::ScanContext;
use attendsync_core::models::StorageBucket;
use attendsync_core::utils::{format_age, format_bytes, truncate_string};
use attendsync_core::{Runtime, StoreMode, SyncSummary};

/// Longest error message shown per failed record
const ERROR_DISPLAY_LEN: usize = 80;

pub enum ScanInput {
    Qr(String),
    Lrn(String),
    Manual { student_id: String, name: Option<String> },
}

pub enum CleanupMode {
    Quick,
    Routine,
    Emergency,
    All,
}

pub async fn login(mut runtime: Runtime, token: String, username: String, role: Option<String>) -> Result<()> {
    let data = SessionData::new(token, username.clone(), role.clone());
    let expires_at = data.expires_at();
    runtime.session.update(data);
    runtime.session.save().context("Failed to save session")?;

    // Kept locally as an audit trail; login attempts are never replayed.
    if let Err(e) = runtime.recorder.record_login(&username, role.as_deref()).await {
        debug!(error = %e, "Failed to record login attempt");
    }

    println!("Logged in as {} (session expires {})", username, expires_at.format("%Y-%m-%d %H:%M UTC"));
    Ok(())
}

pub fn logout(mut runtime: Runtime) -> Result<()> {
    runtime.session.clear().context("Failed to clear session")?;
    println!("Logged out");
    Ok(())
}

pub async fn scan(runtime: &Runtime, input: ScanInput, context: &ScanContext) -> Result<()> {
    let recorder = &runtime.recorder;
    let id = match input {
        ScanInput::Qr(data) => recorder.record_qr(&data, context).await?,
        ScanInput::Lrn(lrn) => recorder.record_lrn(&lrn, context).await?,
        ScanInput::Manual { student_id, name } => {
            recorder.record_manual(&student_id, name.as_deref(), context).await?
        }
    };

    let pending = runtime.store.pending_counts().await;
    println!(
        "Attendance recorded offline (record {}). {} record(s) waiting to sync.",
        id,
        pending.total()
    );
    if let Some(notice) = runtime.store_mode.notice() {
        println!("Warning: {}", notice);
    }
    Ok(())
}

pub async fn form(runtime: &Runtime, form_type: &str, data: &str) -> Result<()> {
    let data: serde_json::Value = serde_json::from_str(data).context("Form data must be valid JSON")?;
    let id = runtime.recorder.record_form(form_type, data).await?;
    println!("Form saved offline (record {}). It will be submitted when online.", id);
    Ok(())
}

pub async fn sync(runtime: &Runtime, force: bool) -> Result<()> {
    let pending = runtime.engine.pending_counts().await;
    if pending.attendance + pending.forms == 0 {
        println!("Nothing to sync.");
        return Ok(());
    }

    if !runtime.probe_connectivity().await {
        println!(
            "Server unreachable at {}. {} record(s) remain queued.",
            runtime.config.server_url,
            pending.total()
        );
        return Ok(());
    }

    let summary = if force {
        runtime.engine.sync_now().await
    } else {
        runtime.engine.sync_pending().await
    };
    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &SyncSummary) {
    println!("Synced {} record(s), {} failed.", summary.success, summary.failed);
    if summary.deferred > 0 {
        println!(
            "{} record(s) are waiting out a retry delay (use --force to send them now).",
            summary.deferred
        );
    }
    for error in &summary.errors {
        println!(
            "  {} #{}: {}",
            error.store,
            error.record_id,
            truncate_string(&error.error, ERROR_DISPLAY_LEN)
        );
    }
}

pub async fn status(runtime: &Runtime, check_server: bool) -> Result<()> {
    let pending = runtime.store.pending_counts().await;
    println!("Server:   {}", runtime.config.server_url);
    println!(
        "Store:    {}",
        match &runtime.store_mode {
            StoreMode::Full => "ok".to_string(),
            mode => mode.notice().unwrap_or_else(|| format!("{:?}", mode)),
        }
    );
    match &runtime.session.data {
        Some(session) if !session.is_expired() => println!(
            "Session:  {} ({} min left)",
            session.username,
            session.minutes_until_expiry()
        ),
        Some(session) => println!("Session:  {} (expired)", session.username),
        None => println!("Session:  not logged in"),
    }
    println!(
        "Pending:  {} attendance, {} forms, {} logins",
        pending.attendance, pending.forms, pending.logins
    );

    let stats = runtime.cache.cleanup_stats().await;
    for bucket in StorageBucket::ALL {
        let usage = stats.usage.bucket(bucket);
        println!(
            "  {:<15} {} / {} ({:.1}%)",
            bucket.label(),
            format_bytes(usage.bytes),
            format_bytes(usage.max_bytes),
            usage.percentage
        );
    }
    match (stats.last_cleanup, stats.last_tier) {
        (Some(at), Some(tier)) => println!("Cleanup:  {} ({}), {} total", format_age(at), tier.label(), stats.cleanup_count),
        _ => println!("Cleanup:  never"),
    }
    for recommendation in &stats.recommendations {
        println!("  - {}", recommendation);
    }

    if check_server {
        match runtime.api.check_version().await {
            Ok(info) if info.from_cache => println!("Version:  {} (cached, server unreachable)", info.version),
            Ok(info) => println!("Version:  {}", info.version),
            Err(e) => println!("Version:  unavailable ({})", e),
        }
    }
    Ok(())
}

pub async fn cleanup(runtime: &Runtime, mode: CleanupMode) -> Result<()> {
    let cache = &runtime.cache;
    match mode {
        CleanupMode::All => {
            let result = cache.clear_all_caches().await;
            println!("Cleared {} cache bucket(s), {} error(s).", result.cleaned, result.errors);
        }
        CleanupMode::Quick => match cache.quick_cleanup().await {
            Some(report) => print_report(&report),
            None => println!("Quick cleanup skipped."),
        },
        CleanupMode::Routine => print_report(&cache.perform_routine_cleanup().await),
        CleanupMode::Emergency => print_report(&cache.perform_emergency_cleanup().await),
    }
    Ok(())
}

fn print_report(report: &CleanupReport) {
    println!(
        "{} cleanup removed {} item(s) in {} ms ({} error(s)).",
        report.tier.label(),
        report.total_cleaned(),
        report.elapsed_ms,
        report.total_errors()
    );
    println!(
        "  responses {}, records {}, cache entries {}",
        report.response_cache.cleaned, report.local_store.cleaned, report.cache_entries.cleaned
    );
    if let Some(aggressive) = &report.aggressive {
        println!("  aggressive pass removed {}", aggressive.cleaned);
    }
    if let Some(usage) = &report.usage_after {
        println!("  total usage now {:.1}%", usage.total.percentage);
    }
}

pub async fn repair(runtime: &Runtime) -> Result<()> {
    for (kind, report) in runtime.store.repair_all().await? {
        println!("{}: repaired {} of {}", kind, report.repaired, report.total);
    }
    Ok(())
}

pub async fn reset(runtime: &Runtime, yes: bool) -> Result<()> {
    let pending = runtime.store.pending_counts().await;
    if !yes {
        bail!(
            "Reset deletes all offline records ({} not yet synced). Re-run with --yes to confirm.",
            pending.total()
        );
    }
    runtime.store.reset().await?;
    println!("Offline database reset ({} unsynced record(s) discarded).", pending.total());
    Ok(())
}
