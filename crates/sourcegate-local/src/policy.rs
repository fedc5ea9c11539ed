//! Fail-closed acceptance of classified pages.

use crate::classify::is_generic_path;
use sourcegate_core::{PageClassification, PageVerdict, RejectReason, Verification};

/// Decide whether a retrieved page may be cited.
///
/// Rules, first match wins:
/// 1. status outside `[200, 300)` rejects with `http_error:<status>`
/// 2. a shallow landing path rejects with `generic_redirect`, unless the verdict is positive
/// 3. `blocked`, `listing_empty`, `generic`, `error` reject with their own reason
/// 4. `product` and `listing_with_products` accept
pub fn verify(status: u16, final_url: &str, classification: &PageClassification) -> Verification {
    use PageVerdict::*;

    let verdict = classification.verdict;
    if !(200..300).contains(&status) {
        return reject(RejectReason::HttpError(status));
    }
    if is_generic_path(final_url) && !verdict.is_positive() {
        return reject(RejectReason::GenericRedirect);
    }
    match verdict {
        Blocked => reject(RejectReason::Blocked),
        ListingEmpty => reject(RejectReason::EmptyListing),
        Generic => reject(RejectReason::GenericRedirect),
        Error => reject(RejectReason::TransportError),
        Product | ListingWithProducts => Verification::Accepted {
            reason: format!("{verdict}: {}", classification.reason),
        },
    }
}

fn reject(reason: RejectReason) -> Verification {
    Verification::Rejected { reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use sourcegate_core::PageSignals;

    fn classification(verdict: PageVerdict) -> PageClassification {
        PageClassification {
            verdict,
            product_count: if verdict.is_positive() { 4 } else { 0 },
            reason: "test".to_string(),
            signals: PageSignals::default(),
            product_candidate_links: Vec::new(),
        }
    }

    fn rejected(v: &Verification) -> Option<RejectReason> {
        match v {
            Verification::Rejected { reason } => Some(*reason),
            Verification::Accepted { .. } => None,
        }
    }

    #[test]
    fn http_errors_win_regardless_of_body() {
        let v = verify(403, "https://shop.example/product/x", &classification(PageVerdict::Product));
        assert_eq!(rejected(&v), Some(RejectReason::HttpError(403)));
        let v = verify(301, "https://shop.example/product/x", &classification(PageVerdict::Product));
        assert_eq!(rejected(&v), Some(RejectReason::HttpError(301)));
    }

    #[test]
    fn shallow_paths_need_a_positive_verdict() {
        let v = verify(200, "https://shop.example/", &classification(PageVerdict::Blocked));
        assert_eq!(rejected(&v), Some(RejectReason::GenericRedirect));

        let v = verify(
            200,
            "https://shop.example/search?q=x",
            &classification(PageVerdict::ListingWithProducts),
        );
        assert!(v.is_accepted());
    }

    #[test]
    fn negative_verdicts_map_to_reasons() {
        let url = "https://shop.example/deals/a";
        let cases = [
            (PageVerdict::Blocked, RejectReason::Blocked),
            (PageVerdict::ListingEmpty, RejectReason::EmptyListing),
            (PageVerdict::Generic, RejectReason::GenericRedirect),
            (PageVerdict::Error, RejectReason::TransportError),
        ];
        for (verdict, want) in cases {
            assert_eq!(rejected(&verify(200, url, &classification(verdict))), Some(want));
        }
    }

    #[test]
    fn positive_verdicts_accept_with_reason() {
        let v = verify(200, "https://shop.example/product/x", &classification(PageVerdict::Product));
        assert_eq!(
            v,
            Verification::Accepted {
                reason: "product: test".to_string()
            }
        );
    }

    proptest! {
        #[test]
        fn fail_closed_for_non_positive_verdicts(
            status in 0u16..1000,
            idx in 0usize..PageVerdict::ALL.len(),
            path in "[a-z0-9/]{0,24}",
        ) {
            let verdict = PageVerdict::ALL[idx];
            let url = format!("https://shop.example/{path}");
            let v = verify(status, &url, &classification(verdict));
            if !verdict.is_positive() || !(200..300).contains(&status) {
                prop_assert!(!v.is_accepted());
            } else {
                prop_assert!(v.is_accepted());
            }
        }
    }
}
