//! Combining partial outputs produced by several upstream tasks.
//!
//! A field is "produced" when it is a non-empty string or a `Some`. Merging
//! keeps the receiver's value unless `newer` produced one, so folding parents
//! in order gives last-merged-wins for fields both parents set. Numbers and
//! booleans have no empty value and should be wrapped in `Option`.

pub trait Merge {
    fn merge(&mut self, newer: Self);

    fn merged(mut self, newer: Self) -> Self
    where
        Self: Sized,
    {
        self.merge(newer);
        self
    }
}

impl Merge for String {
    fn merge(&mut self, newer: Self) {
        if !newer.is_empty() {
            *self = newer;
        }
    }
}

impl<T> Merge for Option<T> {
    fn merge(&mut self, newer: Self) {
        if newer.is_some() {
            *self = newer;
        }
    }
}

/// Implement [`Merge`] for a struct by merging the listed fields one by one.
///
/// ```
/// use deploygraph::{Merge, merge_fields};
///
/// #[derive(Default)]
/// struct Output {
///     namespace: String,
///     replicas: Option<u32>,
/// }
/// merge_fields!(Output { namespace, replicas });
///
/// let a = Output { namespace: "ns".into(), replicas: None };
/// let b = Output { namespace: String::new(), replicas: Some(3) };
/// let m = a.merged(b);
/// assert_eq!(m.namespace, "ns");
/// assert_eq!(m.replicas, Some(3));
/// ```
#[macro_export]
macro_rules! merge_fields {
    ($ty:ty { $($field:ident),* $(,)? }) => {
        impl $crate::Merge for $ty {
            fn merge(&mut self, newer: Self) {
                $( $crate::Merge::merge(&mut self.$field, newer.$field); )*
            }
        }
    };
}
