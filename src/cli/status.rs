//! Ledger status command handler.

use anyhow::Result;

use super::Admin;

/// Print ledger-wide counts and the active configuration.
pub(crate) async fn cmd_status(ctx: &Admin) -> Result<()> {
    let users = ctx.ledger.user_count().await?;
    let stats = ctx.referrals.stats().await?;
    let (_, source) = ctx.ledger.quota().resolve().await?;
    let r = ctx.referrals.settings();

    println!("quotaledger v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!(
        "Database:   {}",
        ctx.config.storage.resolved_path().display()
    );
    println!("Epoch:      midnight UTC{}", ctx.ledger.epoch_offset());
    println!("Quota map:  {}", source.as_str());
    println!(
        "Referrals:  reward {} / cap {} / {} messages within {} days",
        r.reward, r.cap, r.required, r.deadline_days
    );
    println!();
    println!("Users:      {}", users);
    println!(
        "Referrals:  {} pending, {} activated, {} expired",
        stats.pending, stats.activated, stats.expired
    );
    Ok(())
}
