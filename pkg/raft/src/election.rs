//! Randomized timers and the vote-granting rule (§4.4).

use std::time::Duration;

use rand::Rng;

use crate::config::NodeConfig;
use crate::entry::VoteRequest;
use crate::{LogIndex, PeerId, Term};

pub fn random_election_timeout(cfg: &NodeConfig) -> Duration {
    random_in_range(cfg.election_timeout)
}

pub fn random_campaign_backoff(cfg: &NodeConfig) -> Duration {
    random_in_range(cfg.campaign_backoff)
}

fn random_in_range((lo, hi): (Duration, Duration)) -> Duration {
    if hi <= lo {
        return lo;
    }
    let lo_ms = lo.as_millis() as u64;
    let hi_ms = hi.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(lo_ms..=hi_ms))
}

/// Outcome of evaluating an incoming [`VoteRequest`] against this node's
/// current (term, vote, pterm, pindex), before any persistence happens.
/// The caller is responsible for actually persisting `adopt_term`/the
/// grant before sending the response, per the "persist before outgoing RPC"
/// invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteEvaluation {
    /// Set when the request's term is strictly higher than ours: the
    /// caller must adopt it, clear any existing vote, and step down to
    /// Follower if not already one -- regardless of whether a grant
    /// follows.
    pub adopt_term: Option<Term>,
    pub grant: bool,
    /// Term to carry in the `VoteResponse`.
    pub respond_term: Term,
}

pub fn evaluate_vote_request(
    current_term: Term,
    current_vote: Option<PeerId>,
    pterm: Term,
    pindex: LogIndex,
    req: &VoteRequest,
) -> VoteEvaluation {
    if req.term < current_term {
        return VoteEvaluation {
            adopt_term: None,
            grant: false,
            respond_term: current_term,
        };
    }

    let (effective_term, effective_vote, adopt_term) = if req.term > current_term {
        (req.term, None, Some(req.term))
    } else {
        (current_term, current_vote, None)
    };

    let log_ok = req.last_term >= pterm && req.last_index >= pindex;
    let vote_ok = effective_vote.is_none() || effective_vote == Some(req.candidate);
    let grant = vote_ok && log_ok;

    VoteEvaluation {
        adopt_term,
        grant,
        respond_term: effective_term,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(term: Term, last_term: Term, last_index: LogIndex, candidate: PeerId) -> VoteRequest {
        VoteRequest { term, last_term, last_index, candidate }
    }

    #[test]
    fn stale_term_is_rejected_without_adopting() {
        let ev = evaluate_vote_request(5, None, 4, 10, &req(4, 4, 10, 2));
        assert!(!ev.grant);
        assert_eq!(ev.adopt_term, None);
        assert_eq!(ev.respond_term, 5);
    }

    #[test]
    fn higher_term_is_adopted_even_if_log_is_behind() {
        let ev = evaluate_vote_request(5, Some(1), 4, 10, &req(6, 3, 5, 2));
        assert_eq!(ev.adopt_term, Some(6));
        assert!(!ev.grant); // candidate's log is behind ours
    }

    #[test]
    fn grants_when_unvoted_and_log_at_least_as_up_to_date() {
        let ev = evaluate_vote_request(5, None, 4, 10, &req(5, 4, 10, 2));
        assert!(ev.grant);
    }

    #[test]
    fn does_not_grant_twice_to_different_candidates_same_term() {
        let ev = evaluate_vote_request(5, Some(3), 4, 10, &req(5, 4, 10, 2));
        assert!(!ev.grant);
    }

    #[test]
    fn re_grants_same_candidate_same_term() {
        let ev = evaluate_vote_request(5, Some(2), 4, 10, &req(5, 4, 10, 2));
        assert!(ev.grant);
    }
}
