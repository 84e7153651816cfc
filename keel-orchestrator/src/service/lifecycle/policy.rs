//! Bid selection policies

use keel_core::domain::bid::Bid;

/// Picks the winning bid of a bidding round
///
/// `bids` holds the valid, unexpired bids in arrival order. Returning an
/// index ends the round; returning `None` keeps waiting until the window
/// closes, at which point `window_closed` is set and `None` means no winner.
pub trait BidPolicy: Send + Sync {
    fn select(&self, bids: &[Bid], eligible: usize, window_closed: bool) -> Option<usize>;
}

/// The first valid bid wins immediately
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstValidBid;

impl BidPolicy for FirstValidBid {
    fn select(&self, bids: &[Bid], _eligible: usize, _window_closed: bool) -> Option<usize> {
        if bids.is_empty() { None } else { Some(0) }
    }
}

/// Cheapest bid wins once every eligible node bid or the window closed.
/// Ties go to the earlier bid.
#[derive(Debug, Clone, Copy, Default)]
pub struct LowestCostBid;

impl BidPolicy for LowestCostBid {
    fn select(&self, bids: &[Bid], eligible: usize, window_closed: bool) -> Option<usize> {
        if !window_closed && bids.len() < eligible {
            return None;
        }

        bids.iter()
            .enumerate()
            .min_by_key(|(index, bid)| (bid.terms.cost, *index))
            .map(|(index, _)| index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use keel_core::domain::bid::BidTerms;
    use uuid::Uuid;

    fn bid(node: &str, cost: u64) -> Bid {
        Bid {
            job_id: Uuid::new_v4(),
            node_id: node.to_string(),
            terms: BidTerms { cost, note: None },
            expires_at: Utc::now() + Duration::minutes(5),
        }
    }

    #[test]
    fn test_first_valid_bid() {
        assert_eq!(FirstValidBid.select(&[], 3, false), None);
        assert_eq!(FirstValidBid.select(&[bid("a", 9), bid("b", 1)], 3, false), Some(0));
    }

    #[test]
    fn test_lowest_cost_waits_for_all_bids() {
        let bids = [bid("a", 9), bid("b", 1)];

        assert_eq!(LowestCostBid.select(&bids, 3, false), None);
        assert_eq!(LowestCostBid.select(&bids, 2, false), Some(1));
        assert_eq!(LowestCostBid.select(&bids, 3, true), Some(1));
        assert_eq!(LowestCostBid.select(&[], 3, true), None);
    }

    #[test]
    fn test_lowest_cost_tie_goes_to_earliest() {
        let bids = [bid("a", 4), bid("b", 2), bid("c", 2)];
        assert_eq!(LowestCostBid.select(&bids, 3, false), Some(1));
    }
}
