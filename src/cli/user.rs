//! Per-user admin commands.

use anyhow::{bail, Result};

use quotaledger::ledger::subscription_for_days;

use super::{fmt_time, Admin, UserAction};

/// Handle `quotaledger user` subcommands.
pub(crate) async fn cmd_user(ctx: &Admin, action: UserAction) -> Result<()> {
    match action {
        UserAction::Show { user } => {
            let hash = ctx.resolve(&user);
            let Some(rec) = ctx.ledger.user(hash.as_str()).await? else {
                println!("No ledger row for {}.", hash);
                return Ok(());
            };
            let now = ctx.ledger.clock().now();
            println!("User:            {}", rec.user_hash);
            println!("Created:         {}", fmt_time(Some(rec.created_at)));
            println!("Tier:            {}", rec.tier);
            println!("Subscription:    {}", fmt_time(rec.subscription_until));
            println!("Daily remaining: {}", rec.daily_remaining);
            println!(
                "Resets at:       {}{}",
                fmt_time(Some(rec.reset_at)),
                if now >= rec.reset_at { " (due)" } else { "" }
            );
            println!("Bonus balance:   {}", rec.bonus_balance);
            println!(
                "Referral earned: {} / {}",
                rec.earned_referral_credits,
                ctx.referrals.settings().cap
            );
            println!("Referred by:     {}", rec.referrer.as_deref().unwrap_or("-"));
        }
        UserAction::SetTier { user, tier, days } => {
            let hash = ctx.resolve(&user);
            let until = subscription_for_days(ctx.ledger.clock().now(), days);
            if days > 0 && until.is_none() {
                bail!("--days {} is out of range", days);
            }
            if !ctx.ledger.set_tier(hash.as_str(), &tier, until).await? {
                bail!("invalid tier '{}': use 1-32 letters, digits, '_' or '-'", tier);
            }
            println!(
                "{} -> tier {} until {}. Allowance updates at next reset; run force-reset to apply now.",
                hash.short(),
                tier.trim().to_ascii_uppercase(),
                fmt_time(until),
            );
        }
        UserAction::ForceReset { user } => {
            let hash = ctx.resolve(&user);
            ctx.ledger.force_reset(hash.as_str()).await?;
            if let Some(snap) = ctx.ledger.snapshot(hash.as_str()).await? {
                println!(
                    "{} reset: {} remaining today, next reset {}.",
                    hash.short(),
                    snap.daily_remaining,
                    fmt_time(Some(snap.reset_at)),
                );
            }
        }
        UserAction::Grant { user, amount } => {
            let hash = ctx.resolve(&user);
            if !ctx.ledger.grant_bonus(hash.as_str(), amount).await? {
                bail!("amount must be positive");
            }
            let balance = ctx
                .ledger
                .snapshot(hash.as_str())
                .await?
                .map(|s| s.bonus_balance)
                .unwrap_or_default();
            println!("Granted {} to {}; bonus balance {}.", amount, hash.short(), balance);
        }
        UserAction::Hash { raw } => {
            println!("{}", quotaledger::UserHash::derive(&ctx.config.identity.secret, raw.trim()));
        }
    }
    Ok(())
}
