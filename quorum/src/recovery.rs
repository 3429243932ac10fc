// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

//! Choice of the definitive recovery value among a quorum of prepare
//! responses. The order is: any previously accepted value beats any bare
//! segment, and among accepted values the highest accepting epoch wins;
//! otherwise the segment written under the highest writer epoch wins, the
//! longest of those, and finally the lowest peer address for stability.
//! Accepted-first is the paxos safety rule; longest-under-highest-writer
//! keeps every durably journaled transaction.

use journal_types::{protocol::PrepareRecoveryResponse, segment, SegmentInfo};
use std::{cmp::Ordering, collections::HashMap, net::SocketAddr};

pub(crate) struct ChosenRecovery {
    pub peer: SocketAddr,
    /// The value to replicate: txid range and byte length.
    pub value: SegmentInfo,
    /// Name of the file backing the value on the winning peer.
    pub source_name: String,
}

pub(crate) fn choose_recovery_value(
    responses: &HashMap<SocketAddr, PrepareRecoveryResponse>,
) -> Option<ChosenRecovery> {
    let mut peers: Vec<SocketAddr> = responses.keys().copied().collect();
    peers.sort();

    let mut best: Option<(SocketAddr, &PrepareRecoveryResponse)> = None;
    for peer in peers {
        let response = &responses[&peer];
        if response.accepted.is_none() && response.segment.is_none() {
            continue;
        }
        best = match best {
            None => Some((peer, response)),
            Some((best_peer, best_response)) => {
                if compare_responses(response, best_response) == Ordering::Greater {
                    Some((peer, response))
                } else {
                    Some((best_peer, best_response))
                }
            }
        };
    }

    let (peer, response) = best?;
    if let Some(accepted) = &response.accepted {
        // An acceptor always holds an accepted value as an in-progress file.
        Some(ChosenRecovery {
            peer,
            value: accepted.segment.clone(),
            source_name: segment::in_progress_name(accepted.segment.start_txid),
        })
    } else {
        let value = response
            .segment
            .as_ref()
            .expect("filtered responses carry a segment")
            .clone();
        let source_name = value.file_name();
        Some(ChosenRecovery { peer, value, source_name })
    }
}

fn compare_responses(a: &PrepareRecoveryResponse, b: &PrepareRecoveryResponse) -> Ordering {
    match (&a.accepted, &b.accepted) {
        (Some(accepted_a), Some(accepted_b)) => {
            accepted_a.accepted_in_epoch.cmp(&accepted_b.accepted_in_epoch)
        }
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => match (&a.segment, &b.segment) {
            (Some(segment_a), Some(segment_b)) => a
                .last_writer_epoch
                .cmp(&b.last_writer_epoch)
                .then(segment_a.end_txid.cmp(&segment_b.end_txid)),
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => Ordering::Equal,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use journal_types::protocol::AcceptedRecovery;
    use std::net::{IpAddr, Ipv4Addr};

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn segment(end_txid: u64) -> SegmentInfo {
        SegmentInfo {
            start_txid: 1,
            end_txid,
            len_bytes: end_txid * 2,
            is_in_progress: true,
        }
    }

    fn bare(end_txid: u64, last_writer_epoch: u64) -> PrepareRecoveryResponse {
        PrepareRecoveryResponse {
            segment: Some(segment(end_txid)),
            accepted: None,
            last_writer_epoch,
        }
    }

    fn accepted(end_txid: u64, accepted_in_epoch: u64) -> PrepareRecoveryResponse {
        PrepareRecoveryResponse {
            segment: Some(segment(end_txid)),
            accepted: Some(AcceptedRecovery {
                accepted_in_epoch,
                segment: segment(end_txid),
                from_url: "http://127.0.0.1:8480/getimage?filename=x&jid=j".to_string(),
            }),
            last_writer_epoch: accepted_in_epoch,
        }
    }

    // Paxos safety: a previously accepted value beats any bare segment,
    // longer or shorter.
    #[test]
    fn accepted_value_beats_bare_segments() {
        let mut responses = HashMap::new();
        responses.insert(peer(1), accepted(2, 1));
        responses.insert(peer(2), bare(5, 1));
        responses.insert(peer(3), bare(1, 1));

        let chosen = choose_recovery_value(&responses).unwrap();
        assert_eq!(chosen.peer, peer(1));
        assert_eq!(chosen.value.end_txid, 2);
        assert_eq!(chosen.source_name, "edits_inprogress_1");
    }

    #[test]
    fn highest_accepting_epoch_wins_among_accepted() {
        let mut responses = HashMap::new();
        responses.insert(peer(1), accepted(2, 2));
        responses.insert(peer(2), accepted(3, 5));

        let chosen = choose_recovery_value(&responses).unwrap();
        assert_eq!(chosen.peer, peer(2));
        assert_eq!(chosen.value.end_txid, 3);
    }

    // Without accepted values, the highest writer epoch wins even over a
    // longer segment from an older writer.
    #[test]
    fn writer_epoch_beats_length() {
        let mut responses = HashMap::new();
        responses.insert(peer(1), bare(10, 1));
        responses.insert(peer(2), bare(3, 2));

        let chosen = choose_recovery_value(&responses).unwrap();
        assert_eq!(chosen.peer, peer(2));
        assert_eq!(chosen.value.end_txid, 3);
    }

    #[test]
    fn longest_segment_wins_within_one_writer_epoch() {
        let mut responses = HashMap::new();
        responses.insert(peer(1), bare(3, 2));
        responses.insert(peer(2), bare(5, 2));
        responses.insert(peer(3), bare(4, 2));

        let chosen = choose_recovery_value(&responses).unwrap();
        assert_eq!(chosen.peer, peer(2));
        assert_eq!(chosen.value.end_txid, 5);
        assert_eq!(chosen.source_name, "edits_inprogress_1");
    }

    // Full ties go to the lowest peer address, deterministically.
    #[test]
    fn ties_break_by_peer_address() {
        let mut responses = HashMap::new();
        responses.insert(peer(3), bare(5, 2));
        responses.insert(peer(1), bare(5, 2));
        responses.insert(peer(2), bare(5, 2));

        let chosen = choose_recovery_value(&responses).unwrap();
        assert_eq!(chosen.peer, peer(1));
    }

    // Peers with nothing recoverable are ignored; all-empty means there is
    // nothing to recover.
    #[test]
    fn empty_responses_yield_no_value() {
        let empty = PrepareRecoveryResponse {
            segment: None,
            accepted: None,
            last_writer_epoch: 0,
        };
        let mut responses = HashMap::new();
        responses.insert(peer(1), empty.clone());
        responses.insert(peer(2), empty);
        assert!(choose_recovery_value(&responses).is_none());

        let mut responses = HashMap::new();
        responses.insert(
            peer(1),
            PrepareRecoveryResponse {
                segment: None,
                accepted: None,
                last_writer_epoch: 3,
            },
        );
        responses.insert(peer(2), bare(2, 1));
        let chosen = choose_recovery_value(&responses).unwrap();
        assert_eq!(chosen.peer, peer(2));
    }

    // A finalized segment on the winner is fetched under its finalized name.
    #[test]
    fn finalized_winner_keeps_its_name() {
        let mut responses = HashMap::new();
        responses.insert(
            peer(1),
            PrepareRecoveryResponse {
                segment: Some(SegmentInfo {
                    start_txid: 1,
                    end_txid: 3,
                    len_bytes: 6,
                    is_in_progress: false,
                }),
                accepted: None,
                last_writer_epoch: 1,
            },
        );
        let chosen = choose_recovery_value(&responses).unwrap();
        assert_eq!(
            chosen.source_name,
            "edits_0000000000000000001-0000000000000000003"
        );
    }
}
