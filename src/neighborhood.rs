//! Expansion of one seed host into an ordered set of nearby hosts.
//!
//! A CIDR origin yields every address of the block in ascending order. Any
//! other origin is resolved to a single IPv4 seed and widened outward one
//! address at a time, alternating below and above the seed, for `depth`
//! extra steps.

use crate::error::ScanError;
use crate::target::{Host, is_cidr, lookup_ipv4};
use futures::Stream;
use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const NEIGHBORHOOD_BUFFER: usize = 64;

/// Finite stream of hosts produced in the background by [`accumulate`].
///
/// Dropping it stops the producer.
pub struct Neighborhood {
    inner: ReceiverStream<Host>,
}

impl Stream for Neighborhood {
    type Item = Host;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Host>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Next address above `ip`, or `None` past 255.255.255.255.
pub fn next_addr(ip: Ipv4Addr) -> Option<Ipv4Addr> {
    u32::from(ip).checked_add(1).map(Ipv4Addr::from)
}

/// Next address below `ip`, or `None` past 0.0.0.0.
pub fn prev_addr(ip: Ipv4Addr) -> Option<Ipv4Addr> {
    u32::from(ip).checked_sub(1).map(Ipv4Addr::from)
}

/// Addresses visited by the depth walk around `seed`, seed first.
///
/// Odd steps go one below the lowest address so far, even steps one above
/// the highest. The walk never wraps: the step that would cross 0.0.0.0 or
/// 255.255.255.255 ends it, so fewer than `1 + depth` addresses come back
/// at the edges of the address space.
pub fn walk(seed: Ipv4Addr, depth: u32) -> impl Iterator<Item = Ipv4Addr> {
    let mut low = seed;
    let mut high = seed;
    let mut step = 0u32;
    let mut done = false;

    std::iter::from_fn(move || {
        if done || step > depth {
            return None;
        }
        let current = step;
        step += 1;

        if current == 0 {
            return Some(seed);
        }

        let next = if current % 2 == 1 {
            prev_addr(low).inspect(|ip| low = *ip)
        } else {
            next_addr(high).inspect(|ip| high = *ip)
        };

        if next.is_none() {
            log::debug!("[neighborhood] walk_boundary: seed={} step={}", seed, current);
            done = true;
        }
        next
    })
}

/// Expand `origin` into the hosts to probe.
///
/// Resolution happens before any host is produced, so an unresolvable
/// origin is reported here rather than as a short stream.
pub async fn accumulate(origin: &str, port: u16, depth: u32) -> Result<Neighborhood, ScanError> {
    let template = Host::new(origin, port)?;
    let (tx, rx) = mpsc::channel(NEIGHBORHOOD_BUFFER);

    if is_cidr(origin) {
        let network: Ipv4Network = origin
            .parse()
            .map_err(|e| ScanError::resolution(origin, e))?;
        log::debug!("[neighborhood] accumulate: origin={} kind=cidr network={} size={}",
            origin, network.network(), network.size());

        tokio::spawn(async move {
            for ip in network.iter() {
                if tx.send(template.with_address(ip)).await.is_err() {
                    log::trace!("[neighborhood] consumer_dropped: origin={}", template.origin);
                    break;
                }
            }
        });
    } else {
        let seed = lookup_ipv4(origin).await?;
        log::debug!("[neighborhood] accumulate: origin={} kind=walk seed={} depth={}",
            origin, seed, depth);

        tokio::spawn(async move {
            for ip in walk(seed, depth) {
                if tx.send(template.with_address(ip)).await.is_err() {
                    log::trace!("[neighborhood] consumer_dropped: origin={}", template.origin);
                    break;
                }
            }
        });
    }

    Ok(Neighborhood {
        inner: ReceiverStream::new(rx),
    })
}
