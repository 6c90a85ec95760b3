//! Network flow log codec
//!
//! Flow logs (AWS VPC, Azure NSG exports flattened to text) are delimited
//! rows. Rows where every IP address field is private carry internal
//! east-west traffic only and are dropped before forwarding.

use super::csv::{CsvCodec, CsvOptions};
use super::{Codec, Decoded};
use crate::error::ConnectorResult;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Options for the `flowlog` codec
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FlowlogOptions {
    /// Field separator
    #[serde(default = "default_separator")]
    pub separator: char,

    /// Lines to skip (the header line by default)
    #[serde(default = "default_skip_first")]
    pub skip_first: usize,

    /// Drop lines starting with `#`
    #[serde(default = "default_true")]
    pub skip_comments: bool,
}

fn default_separator() -> char {
    ' '
}

fn default_skip_first() -> usize {
    1
}

fn default_true() -> bool {
    true
}

impl Default for FlowlogOptions {
    fn default() -> Self {
        Self {
            separator: default_separator(),
            skip_first: default_skip_first(),
            skip_comments: true,
        }
    }
}

/// Whether `addr` is private, loopback or link-local
pub fn is_private_ip(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_private_v4(&v4),
            None => is_private_v6(v6),
        },
    }
}

fn is_private_v4(addr: &Ipv4Addr) -> bool {
    addr.is_private() || addr.is_loopback() || addr.is_link_local()
}

fn is_private_v6(addr: &Ipv6Addr) -> bool {
    let first = addr.segments()[0];
    addr.is_loopback()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link-local
        || (first & 0xffc0) == 0xfe80
}

/// Flow log codec
#[derive(Debug, Clone)]
pub struct FlowlogCodec {
    inner: CsvCodec,
}

impl FlowlogCodec {
    pub fn new(options: FlowlogOptions) -> ConnectorResult<Self> {
        let inner = CsvCodec::new(CsvOptions {
            separator: options.separator,
            skip_first: options.skip_first,
            skip_comments: options.skip_comments,
            ..Default::default()
        })?;
        Ok(Self { inner })
    }

    /// Rows with no address at all are kept
    fn all_private(fields: &[String]) -> bool {
        let mut addresses = fields
            .iter()
            .filter_map(|field| field.parse::<IpAddr>().ok())
            .peekable();
        addresses.peek().is_some() && addresses.all(|addr| is_private_ip(&addr))
    }
}

impl Codec for FlowlogCodec {
    fn name(&self) -> &'static str {
        "flowlog"
    }

    fn decode(&self, data: &[u8]) -> ConnectorResult<Decoded> {
        let rows = self.inner.rows(data)?;
        let mut decoded = Decoded {
            records: Vec::with_capacity(rows.rows.len()),
            discarded: rows.malformed,
        };

        for row in &rows.rows {
            if Self::all_private(&row.fields) {
                decoded.discarded += 1;
                continue;
            }
            decoded
                .records
                .push(self.inner.row_record(rows.columns.as_deref(), row)?);
        }
        Ok(decoded)
    }
}
