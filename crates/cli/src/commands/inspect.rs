use cairn_redis::keys::{CREATION_TIME, INVALID_SESSION, LAST_ACCESSED, MAX_INACTIVE_INTERVAL, OWNER};
use cairn_redis::{RedisConfig, SessionKeys, connect, is_meta_field};
use chrono::DateTime;
use clap::Args;
use serde_json::json;

use crate::OutputFormat;
use crate::config::CairnConfig;

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Session id.
    pub id: String,
}

fn timestamp(raw: Option<&str>) -> Option<String> {
    raw.and_then(|v| v.parse::<i64>().ok())
        .and_then(DateTime::from_timestamp_millis)
        .map(|t| t.to_rfc3339())
}

pub async fn run(
    config: &CairnConfig,
    redis: &RedisConfig,
    args: &InspectArgs,
    format: &OutputFormat,
) -> anyhow::Result<()> {
    let facade = connect(redis)?;
    let keys = SessionKeys::new(&config.session.namespace);
    let key = keys.session_key(&args.id);

    let fields = facade.hget_all(&key).await?;
    let ttl_ms = facade.pttl(&key).await?;
    facade.close().await;

    if fields.is_empty() {
        eprintln!("Session {} not found in namespace {}.", args.id, config.session.namespace);
        std::process::exit(1);
    }

    let meta = |name: &str| {
        fields
            .iter()
            .find(|(f, _)| f == name)
            .map(|(_, v)| String::from_utf8_lossy(v).into_owned())
    };
    let mut attributes: Vec<&str> = fields
        .iter()
        .map(|(f, _)| f.as_str())
        .filter(|f| !is_meta_field(f))
        .collect();
    attributes.sort_unstable();

    let created = timestamp(meta(CREATION_TIME).as_deref());
    let last_accessed = timestamp(meta(LAST_ACCESSED).as_deref());
    let max_inactive = meta(MAX_INACTIVE_INTERVAL);
    let owner = meta(OWNER);
    let invalid = meta(INVALID_SESSION).is_some();

    match format {
        OutputFormat::Json => {
            let out = json!({
                "id": args.id,
                "key": key,
                "creation_time": created,
                "last_accessed": last_accessed,
                "max_inactive_interval": max_inactive,
                "owner": owner,
                "invalid": invalid,
                "ttl_ms": ttl_ms,
                "attributes": attributes,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Text => {
            println!("Session:        {}", args.id);
            println!("Key:            {key}");
            println!("Created:        {}", created.as_deref().unwrap_or("-"));
            println!("Last accessed:  {}", last_accessed.as_deref().unwrap_or("-"));
            println!("Max inactive:   {}s", max_inactive.as_deref().unwrap_or("-"));
            if let Some(owner) = &owner {
                println!("Owner:          {owner}");
            }
            if invalid {
                println!("Status:         being removed");
            }
            match ttl_ms {
                -1 => println!("TTL:            none"),
                ms => println!("TTL:            {ms}ms"),
            }
            println!("Attributes ({}):", attributes.len());
            for name in attributes {
                println!("  {name}");
            }
        }
    }
    Ok(())
}
