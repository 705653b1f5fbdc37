//! `Expected<T, E>` — the sum-type result and combinator set used pervasively
//! throughout this crate.
//!
//! This is deliberately a thin wrapper around [`std::result::Result`] rather
//! than a from-scratch type: Rust's `Result` already *is* the sum type the
//! original `zyppng::expected<T,E>` models, so there is no value in
//! reinventing storage. What this module adds is the fixed set of pipeline
//! combinators every download/verification workflow in this crate is built
//! from, so call sites read like the original's
//! `a | and_then(...) | or_else(...)` chains.

/// Alias used throughout the crate; kept distinct from `std::result::Result`
/// in signatures so the pipeline vocabulary below reads naturally.
pub type Expected<T, E> = Result<T, E>;

/// `Expected<(), E>` equivalent for operations with no useful success value.
pub type ExpectedVoid<E> = Expected<(), E>;

/// Run `f` after a successful `Expected`, short-circuiting on error.
///
/// Equivalent to `Result::and_then`; provided under the pipeline's own name
/// so workflow code can be written as a flat chain of `and_then`/`or_else`
/// calls without mixing vocabularies.
pub fn and_then<T, U, E, F>(exp: Expected<T, E>, f: F) -> Expected<U, E>
where
    F: FnOnce(T) -> Expected<U, E>,
{
    exp.and_then(f)
}

/// Recover from an error, the single recovery site in the propagation policy.
pub fn or_else<T, E, F, E2>(exp: Expected<T, E>, f: F) -> Expected<T, E2>
where
    F: FnOnce(E) -> Expected<T, E2>,
{
    match exp {
        Ok(v) => Ok(v),
        Err(e) => f(e),
    }
}

/// Observe a success value without transforming it.
pub fn inspect<T, E, F>(exp: Expected<T, E>, f: F) -> Expected<T, E>
where
    F: FnOnce(&T),
{
    if let Ok(v) = &exp {
        f(v);
    }
    exp
}

/// Observe an error value without transforming it.
pub fn inspect_err<T, E, F>(exp: Expected<T, E>, f: F) -> Expected<T, E>
where
    F: FnOnce(&E),
{
    if let Err(e) = &exp {
        f(e);
    }
    exp
}

/// Apply `f` to every element of a container, producing a container of
/// `Expected` results (one per input element).
pub fn transform<T, U, E, F>(items: Vec<T>, f: F) -> Vec<Expected<U, E>>
where
    F: Fn(T) -> Expected<U, E>,
{
    items.into_iter().map(f).collect()
}

/// Sequence a container of `Expected<T, E>`, short-circuiting on the first
/// error while preserving input order in both the success and the
/// short-circuit path.
pub fn collect<T, E>(items: Vec<Expected<T, E>>) -> Expected<Vec<T>, E> {
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        out.push(item?);
    }
    Ok(out)
}

/// Apply `f` then collect, cancelling at the first error instead of running
/// `f` over every remaining element.
pub fn transform_collect<T, U, E, F>(items: Vec<T>, f: F) -> Expected<Vec<U>, E>
where
    F: Fn(T) -> Expected<U, E>,
{
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        out.push(f(item)?);
    }
    Ok(out)
}

/// A generic, non-specific failure value used by [`mtry`] when the wrapped
/// closure panics-as-error via a boxed `std::error::Error`.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ErrorVal(pub String);

impl ErrorVal {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Wrap a Result-returning call with a foreign error type into an
/// `Expected<T, ErrorVal>`, mirroring the original's `mtry(fn, ...)` combinator.
///
/// Rust has no implicit exceptions, so in practice `mtry` is used here to
/// adapt calls that return a foreign error type (e.g. `std::io::Error`) into
/// the crate's own error vocabulary at a pipeline boundary.
pub fn mtry<T, E, F>(f: F) -> Expected<T, ErrorVal>
where
    F: FnOnce() -> Result<T, E>,
    E: std::fmt::Display,
{
    f().map_err(|e| ErrorVal::new(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn and_then_short_circuits() {
        let exp: Expected<i32, &str> = Err("boom");
        let res = and_then(exp, |v| Ok::<i32, &str>(v + 1));
        assert_eq!(res, Err("boom"));
    }

    #[test]
    fn or_else_recovers() {
        let exp: Expected<i32, &str> = Err("boom");
        let res: Expected<i32, &str> = or_else(exp, |_| Ok(42));
        assert_eq!(res, Ok(42));
    }

    #[test]
    fn collect_preserves_order_and_short_circuits_on_first_error() {
        let items: Vec<Expected<i32, &str>> = vec![Ok(1), Ok(2), Err("nope"), Ok(4)];
        assert_eq!(collect(items), Err("nope"));

        let items: Vec<Expected<i32, &str>> = vec![Ok(1), Ok(2), Ok(3)];
        assert_eq!(collect(items), Ok(vec![1, 2, 3]));
    }

    #[test]
    fn transform_collect_cancels_early() {
        let calls = std::cell::RefCell::new(Vec::new());
        let items = vec![1, 2, 3, 4];
        let res: Expected<Vec<i32>, &str> = transform_collect(items, |v| {
            calls.borrow_mut().push(v);
            if v == 3 {
                Err("stop")
            } else {
                Ok(v * 2)
            }
        });
        assert_eq!(res, Err("stop"));
        assert_eq!(*calls.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn mtry_wraps_foreign_errors() {
        let res: Expected<i32, ErrorVal> = mtry(|| "not a number".parse::<i32>());
        assert!(res.is_err());
    }
}
