// Payload size policy
//
// The global length cap is enforced by the header validator while framing.
// This module enforces the per-type entry ceilings, reading only the
// compact-size count so an oversized list is rejected before it is decoded.

use crate::config::{MAX_ADDR_TO_SEND, MAX_HEADERS_RESULTS, MAX_INV_SZ};
use crate::net::message::peek_list_len;
use crate::net::misbehavior::Misbehavior;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadPolicy {
    pub max_inv: usize,
    pub max_headers: usize,
    pub max_addr: usize,
}

impl Default for PayloadPolicy {
    fn default() -> Self {
        PayloadPolicy {
            max_inv: MAX_INV_SZ,
            max_headers: MAX_HEADERS_RESULTS,
            max_addr: MAX_ADDR_TO_SEND,
        }
    }
}

impl PayloadPolicy {
    /// Ceiling for list-carrying message types, with the static type name
    fn limit_for(&self, msgtype: &str) -> Option<(&'static str, usize)> {
        match msgtype {
            "inv" => Some(("inv", self.max_inv)),
            "getdata" => Some(("getdata", self.max_inv)),
            "notfound" => Some(("notfound", self.max_inv)),
            "headers" => Some(("headers", self.max_headers)),
            "addr" => Some(("addr", self.max_addr)),
            _ => None,
        }
    }

    /// Check a validated payload against its type's entry ceiling. A payload
    /// whose count cannot be read is left for the decoder to reject.
    pub fn check(&self, msgtype: &str, payload: &[u8]) -> Result<(), Misbehavior> {
        let Some((name, limit)) = self.limit_for(msgtype) else {
            return Ok(());
        };
        match peek_list_len(payload) {
            Ok(size) if size > limit as u64 => Err(Misbehavior::OversizedList { msgtype: name, size }),
            _ => Ok(()),
        }
    }
}
