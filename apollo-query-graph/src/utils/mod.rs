//! Small helpers shared across the crate.

pub(crate) mod logging;

/// Computes the cartesian product of the given lists of options, and flattens each resulting
/// combination. An empty outer list yields no combination at all (as opposed to a single empty
/// combination), which callers rely on to signal that nothing could be produced.
pub(crate) fn flat_cartesian_product<T: Clone>(options: Vec<Vec<Vec<T>>>) -> Vec<Vec<T>> {
    if options.is_empty() {
        return vec![];
    }
    let mut result: Vec<Vec<T>> = vec![vec![]];
    for choices in options {
        let mut next = Vec::with_capacity(result.len() * choices.len());
        for prefix in &result {
            for choice in &choices {
                let mut combined = prefix.clone();
                combined.extend(choice.iter().cloned());
                next.push(combined);
            }
        }
        result = next;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cartesian_product_flattens_combinations() {
        let product = flat_cartesian_product(vec![
            vec![vec!["a1"], vec!["a2"]],
            vec![vec!["b1", "b2"]],
        ]);
        assert_eq!(
            product,
            vec![vec!["a1", "b1", "b2"], vec!["a2", "b1", "b2"]]
        );
    }

    #[test]
    fn cartesian_product_of_nothing_is_empty() {
        assert!(flat_cartesian_product::<u8>(vec![]).is_empty());
        assert!(flat_cartesian_product::<u8>(vec![vec![vec![1]], vec![]]).is_empty());
    }
}
