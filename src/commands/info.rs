use bytes::Bytes;
use std::fmt::Write;
use std::str::FromStr;
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};

use crate::commands::{CommandParser, CommandParserError};
use crate::frame::Frame;
use crate::store::StoreStats;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, EnumIter, Display)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Section {
    Server,
    Memory,
    Stats,
    Shards,
    Keyspace,
}

/// Information and statistics about the server, rendered from a [`StoreStats`] snapshot.
/// Unknown sections render as an empty string.
///
/// Ref: <https://redis.io/docs/latest/commands/info/>
#[derive(Debug, Clone, PartialEq)]
pub struct Info {
    pub section: Option<String>,
}

impl Info {
    fn sections(&self) -> Vec<Section> {
        match self.section.as_deref() {
            None => Section::iter().collect(),
            Some(name)
                if ["all", "everything", "default"]
                    .iter()
                    .any(|all| all.eq_ignore_ascii_case(name)) =>
            {
                Section::iter().collect()
            }
            Some(name) => Section::from_str(name).into_iter().collect(),
        }
    }

    pub fn render(&self, stats: &StoreStats) -> Frame {
        let mut out = String::new();

        for section in self.sections() {
            if !out.is_empty() {
                out.push_str("\r\n");
            }
            // Writing into a String never fails.
            let _ = render_section(&mut out, section, stats);
        }

        Frame::Bulk(Bytes::from(out))
    }
}

fn render_section(out: &mut String, section: Section, stats: &StoreStats) -> std::fmt::Result {
    match section {
        Section::Server => {
            writeln!(out, "# Server\r")?;
            writeln!(out, "shardis_version:{}\r", env!("CARGO_PKG_VERSION"))?;
            writeln!(out, "shard_count:{}\r", stats.shard_count)?;
            writeln!(out, "uptime_in_seconds:{}\r", stats.uptime.as_secs())?;
        }
        Section::Memory => {
            writeln!(out, "# Memory\r")?;
            writeln!(out, "used_memory:{}\r", stats.used_memory)?;
            writeln!(out, "used_memory_rss:{}\r", stats.resident)?;
            writeln!(out, "maxmemory:{}\r", stats.maxmemory)?;
            writeln!(out, "memory_ratio:{:.4}\r", stats.memory_ratio)?;
            writeln!(
                out,
                "deny_threshold:{}\r",
                stats.deny_threshold.unwrap_or_default()
            )?;
            writeln!(out, "cache_mode:{}\r", stats.cache_mode as u8)?;
            writeln!(out, "eviction_policy:{}\r", stats.policy)?;
        }
        Section::Stats => {
            let scheduler = stats.scheduler();
            writeln!(out, "# Stats\r")?;
            writeln!(out, "evicted_keys:{}\r", stats.evicted_keys)?;
            writeln!(out, "tx_admitted:{}\r", scheduler.admitted)?;
            writeln!(out, "tx_out_of_order:{}\r", scheduler.out_of_order)?;
            writeln!(out, "tx_queued:{}\r", scheduler.queued)?;
            writeln!(out, "tx_cancelled:{}\r", scheduler.cancelled)?;
        }
        Section::Shards => {
            writeln!(out, "# Shards\r")?;
            for shard in &stats.shards {
                writeln!(
                    out,
                    "shard{}:keys={},used_bytes={},queue_depth={},active={},parked={}\r",
                    shard.shard,
                    shard.keys,
                    shard.used_bytes,
                    shard.queue_depth,
                    shard.active_slots,
                    shard.parked
                )?;
            }
        }
        Section::Keyspace => {
            writeln!(out, "# Keyspace\r")?;
            let keys = stats.keys();
            if keys > 0 {
                writeln!(out, "db0:keys={}\r", keys)?;
            }
        }
    }

    Ok(())
}

impl TryFrom<&mut CommandParser> for Info {
    type Error = Error;

    fn try_from(parser: &mut CommandParser) -> Result<Self, Self::Error> {
        let section = match parser.next_string() {
            Ok(section) => Some(section),
            Err(CommandParserError::EndOfStream) => None,
            Err(err) => return Err(err.into()),
        };

        Ok(Self { section })
    }
}
