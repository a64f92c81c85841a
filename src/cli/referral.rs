//! Referral inspection and maintenance commands.

use anyhow::Result;

use quotaledger::Referral;

use super::{fmt_time, Admin, ReferralAction};

fn print_row(r: &Referral, required: i64) {
    println!(
        "{:<10} {:<10} {:>7} {:<20} {:<20}",
        r.invitee.get(..8).unwrap_or(&r.invitee),
        r.status.as_str(),
        format!("{}/{}", r.progress_count, required),
        fmt_time(Some(r.expires_at)),
        fmt_time(r.activated_at),
    );
}

/// Handle `quotaledger referral` subcommands.
pub(crate) async fn cmd_referral(ctx: &Admin, action: ReferralAction) -> Result<()> {
    let referrals = &ctx.referrals;
    match action {
        ReferralAction::Show { user } => {
            let hash = ctx.resolve(&user);
            let required = referrals.settings().required;
            if let Some(code) = referrals.code_for(hash.as_str()) {
                println!("Referral code: {}", code);
            }

            match referrals.get(hash.as_str()).await? {
                Some(r) => println!(
                    "Invited by {} ({}, {}/{} counted, expires {}).",
                    r.referrer.get(..8).unwrap_or(&r.referrer),
                    r.status,
                    r.progress_count,
                    required,
                    fmt_time(Some(r.expires_at)),
                ),
                None => println!("Not invited by anyone."),
            }

            let made = referrals.list_by_referrer(hash.as_str()).await?;
            if made.is_empty() {
                println!("No referrals made.");
                return Ok(());
            }
            println!();
            println!(
                "{:<10} {:<10} {:>7} {:<20} {:<20}",
                "Invitee", "Status", "Count", "Expires", "Activated"
            );
            println!("{}", "-".repeat(70));
            for r in &made {
                print_row(r, required);
            }
        }
        ReferralAction::Stats => {
            let stats = referrals.stats().await?;
            println!("Pending:   {}", stats.pending);
            println!("Activated: {}", stats.activated);
            println!("Expired:   {}", stats.expired);
            println!("Total:     {}", stats.total());
        }
        ReferralAction::Sweep => {
            let n = referrals.sweep_expired().await?;
            println!("Expired {} overdue referral(s).", n);
        }
    }
    Ok(())
}
