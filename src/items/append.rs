//! Append consistency check between a persisted catalog and a new batch.

use super::catalog::{Catalog, Item};
use crate::error::{Result, StoreError};
use crate::types::Verdict;
use std::collections::BTreeSet;

/// Decide whether `candidate` can be appended after `persisted`.
///
/// - No shared item: the whole batch is new ([`Verdict::Appendable`]).
/// - One shared item: it must be both the last persisted item and the first
///   item of the batch. The batch resumes an interrupted write, so its first
///   item is dropped ([`Verdict::AppendableWithTrim`]). Anywhere else the
///   batch would rewrite history and fails with `NonContiguousAppend`.
/// - Several shared items fail with `AmbiguousOverlap`.
///
/// Returns the catalog that should actually be written, which is empty when
/// the batch held only the resumed item.
pub fn check_appendable<I: Item>(
    persisted: &[I],
    candidate: Catalog<I>,
) -> Result<(Verdict, Catalog<I>)> {
    let mut stored = BTreeSet::new();
    for item in persisted {
        if !stored.insert(item) {
            return Err(StoreError::DuplicateItem(format!("{:?}", item)));
        }
    }

    let shared: Vec<I> = candidate
        .items()
        .iter()
        .filter(|item| stored.contains(item))
        .cloned()
        .collect();

    match shared.as_slice() {
        [] => Ok((Verdict::Appendable, candidate)),
        [item] => {
            let at_tail = persisted.last() == Some(item);
            let at_head = candidate.first() == Some(item);
            if !(at_tail && at_head) {
                return Err(StoreError::NonContiguousAppend(format!("{:?}", item)));
            }
            Ok((Verdict::AppendableWithTrim, candidate.without_first()))
        }
        many => Err(StoreError::AmbiguousOverlap(many.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(items: &str) -> Vec<String> {
        items.chars().map(String::from).collect()
    }

    fn catalog(items: &str) -> Catalog<String> {
        Catalog::new(names(items)).unwrap()
    }

    #[test]
    fn test_disjoint_is_appendable() {
        let (verdict, written) = check_appendable(&names("abc"), catalog("def")).unwrap();
        assert_eq!(verdict, Verdict::Appendable);
        assert_eq!(written, catalog("def"));
    }

    #[test]
    fn test_empty_snapshot_is_appendable() {
        let (verdict, written) = check_appendable(&[], catalog("abc")).unwrap();
        assert_eq!(verdict, Verdict::Appendable);
        assert_eq!(written.len(), 3);
    }

    #[test]
    fn test_resume_last_item_trims() {
        let (verdict, written) = check_appendable(&names("abc"), catalog("cde")).unwrap();
        assert_eq!(verdict, Verdict::AppendableWithTrim);
        assert_eq!(written.items(), &names("de")[..]);
    }

    #[test]
    fn test_resume_only_item_leaves_empty_batch() {
        let (verdict, written) = check_appendable(&names("abc"), catalog("c")).unwrap();
        assert_eq!(verdict, Verdict::AppendableWithTrim);
        assert!(written.is_empty());
    }

    #[test]
    fn test_shared_item_not_at_batch_head() {
        // "c" is the last persisted item but also the last item of the batch
        let result = check_appendable(&names("cde"), catalog("abc"));
        assert!(matches!(result, Err(StoreError::NonContiguousAppend(_))));
    }

    #[test]
    fn test_shared_item_not_at_snapshot_tail() {
        let result = check_appendable(&names("abc"), catalog("bxy"));
        assert!(matches!(result, Err(StoreError::NonContiguousAppend(_))));
    }

    #[test]
    fn test_identical_batch_is_ambiguous() {
        let result = check_appendable(&names("abc"), catalog("abc"));
        assert!(matches!(result, Err(StoreError::AmbiguousOverlap(3))));
    }

    #[test]
    fn test_two_shared_items_are_ambiguous() {
        let result = check_appendable(&names("abc"), catalog("bcd"));
        assert!(matches!(result, Err(StoreError::AmbiguousOverlap(2))));
    }

    #[test]
    fn test_duplicate_in_snapshot_is_corrupt() {
        let result = check_appendable(&names("aba"), catalog("xy"));
        assert!(matches!(result, Err(StoreError::DuplicateItem(_))));
    }

    #[test]
    fn test_directional_compatibility() {
        let l1 = names("cde");
        let l2 = names("abc");
        let l3 = names("def");

        // l2 persisted, then l1 resumes "c"
        assert!(check_appendable(&l2, Catalog::new(l1.clone()).unwrap()).is_ok());
        assert!(check_appendable(&l2, Catalog::new(l3.clone()).unwrap()).is_ok());
        assert!(check_appendable(&l3, Catalog::new(l2.clone()).unwrap()).is_ok());

        assert!(check_appendable(&l3, Catalog::new(l1.clone()).unwrap()).is_err());
        assert!(check_appendable(&l1, Catalog::new(l3.clone()).unwrap()).is_err());
        assert!(check_appendable(&l1, Catalog::new(l1.clone()).unwrap()).is_err());
    }
}
