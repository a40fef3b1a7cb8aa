//! Internal testing utilities for the deform-conv crate.

use std::fmt::Debug;
use std::panic::{RefUnwindSafe, UnwindSafe};

/// Utility for writing table-driven tests.
///
/// To use it, define a struct (conventionally named `Case`) holding the data
/// for a single test case, build a collection of cases and call `test_each`
/// with the test body as a closure:
///
/// ```
/// use deform_conv_testing::TestCases;
///
/// // Add #[test] attribute
/// fn test_double() {
///   #[derive(Debug)]
///   struct Case {
///     input: i32,
///     expected: i32,
///   }
///
///   let cases = [
///     Case { input: 2, expected: 4 },
///     Case { input: -3, expected: -6 },
///   ];
///
///   cases.test_each(|&Case { input, expected }| {
///     assert_eq!(input * 2, expected);
///   });
/// }
/// # test_double();
/// ```
///
/// Each case is run with panics caught, so a failure in one case does not
/// prevent the remaining cases from running. If any case fails, `test_each`
/// panics at the end with the debug representations of the failing cases.
///
/// The test function and the case items must be [unwind
/// safe](std::panic::catch_unwind). In practice this means they must not
/// contain interior mutability. Fields that are not unwind safe can be
/// wrapped with [`AssertUnwindSafe`](std::panic::AssertUnwindSafe), or
/// replaced by a description from which the test body constructs the value.
pub trait TestCases {
    /// The data for a single test case.
    type Case;

    /// Run `test` against each case in `self`, catching panics, then panic
    /// with details of the failing cases if there were any.
    fn test_each(self, test: impl Fn(&Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + RefUnwindSafe;

    /// Variant of [`test_each`](TestCases::test_each) which passes cases to
    /// the test function by value.
    ///
    /// Each case is formatted to a string up front so it can still be
    /// reported if the test panics. This adds a little overhead per case.
    fn test_each_value(self, test: impl Fn(Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + UnwindSafe;
}

impl<I: IntoIterator> TestCases for I {
    type Case = I::Item;

    fn test_each(self, test: impl Fn(&I::Item) + RefUnwindSafe)
    where
        Self::Case: Debug + RefUnwindSafe,
    {
        let failures: Vec<_> = self
            .into_iter()
            .filter(|case| std::panic::catch_unwind(|| test(case)).is_err())
            .collect();
        assert!(
            failures.is_empty(),
            "{} test cases failed: {:?}",
            failures.len(),
            failures
        );
    }

    fn test_each_value(self, test: impl Fn(I::Item) + RefUnwindSafe)
    where
        Self::Case: Debug + UnwindSafe,
    {
        let mut failures = Vec::new();
        for case in self {
            let case_str = format!("{:?}", case);
            let test = &test;
            if std::panic::catch_unwind(move || test(case)).is_err() {
                failures.push(case_str);
            }
        }
        assert!(
            failures.is_empty(),
            "{} test cases failed: {:?}",
            failures.len(),
            failures
        );
    }
}
