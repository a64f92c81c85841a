//! Quota map show / set / clear command handler.

use anyhow::{bail, Result};

use super::{fmt_time, Admin, QuotaSubcommand};

/// Handle `quotaledger quota` subcommands.
pub(crate) async fn cmd_quota(ctx: &Admin, action: QuotaSubcommand) -> Result<()> {
    let quota = ctx.ledger.quota();
    match action {
        QuotaSubcommand::Show => {
            let (map, source) = quota.resolve().await?;

            println!("Effective quota map ({}):", source.as_str());
            if map.is_empty() {
                println!("  (empty; every tier uses the scalar defaults)");
            }
            println!("{:<16} {:>10}", "Tier", "Daily");
            println!("{}", "-".repeat(27));
            // BTreeMap order is already sorted by tier.
            for (tier, limit) in map.iter() {
                println!("{:<16} {:>10}", tier, limit);
            }

            let defaults = quota.defaults();
            println!();
            println!("Defaults: free={} paid={}", defaults.free, defaults.paid);

            match quota.override_record().await? {
                Some(rec) => println!(
                    "Override: {} (version {}, updated {})",
                    rec.value.as_deref().unwrap_or("null"),
                    rec.version,
                    fmt_time(Some(rec.updated_at)),
                ),
                None => println!("Override: none"),
            }
        }
        QuotaSubcommand::Set { json } => {
            if !quota.set_quota_map_json(&json).await? {
                bail!(
                    "rejected quota map: expected a JSON object of non-negative integers, \
                     e.g. {{\"FREE\":12,\"PLUS\":30,\"PREMIUM\":100}}"
                );
            }
            let map = quota.get_quota_map().await?;
            println!("Quota map updated: {}", map.to_json());
        }
        QuotaSubcommand::Clear => {
            if quota.clear_quota_map().await? {
                println!("Runtime override removed.");
            } else {
                println!("No runtime override was set.");
            }
        }
    }

    Ok(())
}
