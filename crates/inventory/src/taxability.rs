//! Taxability classification of removals.

use crate::removal::RemovalCategory;

/// Decides whether a removal category is taxable.
///
/// Implementations must be pure: the same category always yields the same
/// answer, because the flag is re-derived whenever a removal is patched.
pub trait TaxClassifier: Send + Sync + core::fmt::Debug {
    fn is_taxable(&self, category: RemovalCategory) -> bool;
}

/// Current policy: nothing is taxable.
///
/// This is a placeholder, not a business fact; swap in another
/// [`TaxClassifier`] when the facility's tax rules are settled.
#[derive(Debug, Copy, Clone, Default)]
pub struct NonTaxablePolicy;

impl TaxClassifier for NonTaxablePolicy {
    fn is_taxable(&self, _category: RemovalCategory) -> bool {
        false
    }
}

/// Taxable when the category is in the configured set.
#[derive(Debug, Clone, Default)]
pub struct CategoryTaxPolicy {
    taxable: Vec<RemovalCategory>,
}

impl CategoryTaxPolicy {
    pub fn new(taxable: impl IntoIterator<Item = RemovalCategory>) -> Self {
        Self {
            taxable: taxable.into_iter().collect(),
        }
    }
}

impl TaxClassifier for CategoryTaxPolicy {
    fn is_taxable(&self, category: RemovalCategory) -> bool {
        self.taxable.contains(&category)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_never_taxes() {
        for category in RemovalCategory::ALL {
            assert!(!NonTaxablePolicy.is_taxable(category));
        }
    }

    #[test]
    fn category_policy_taxes_listed_categories_only() {
        let policy = CategoryTaxPolicy::new([RemovalCategory::Sale]);
        assert!(policy.is_taxable(RemovalCategory::Sale));
        assert!(!policy.is_taxable(RemovalCategory::Spoilage));
    }
}
