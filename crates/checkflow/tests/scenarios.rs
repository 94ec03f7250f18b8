//! End-to-end checking scenarios.
//!
//! Each test builds a small program, instruments it and inspects the
//! discharged report against what the unchecked program computes.

use checkflow::{
    check_error, checkify, eval, Array, Atom, Error, ErrorCategory, ErrorSet, EvalError, Function,
    FunctionBuilder,
};

fn scalar(x: f64) -> Array {
    Array::scalar(x)
}

fn vector(values: &[f64]) -> Array {
    Array::from_vec(values.to_vec())
}

// =============================================================================
// Program order
// =============================================================================

#[test]
fn test_earlier_bounds_fault_wins_over_later_nan() {
    let f = Function::build(1, |b, p| {
        let y = b.take(&p[0], 5.0);
        vec![b.sin(y)]
    });
    let checked = checkify(&f, ErrorSet::AUTOMATIC_CHECKS).unwrap();
    let (error, outs) = checked.call(&[vector(&[0.0, 1.0, f64::INFINITY])]).unwrap();

    let message = error.get().unwrap();
    assert!(message.starts_with("out-of-bounds indexing"), "{message}");
    assert_eq!(
        message,
        "out-of-bounds indexing: index 5 is out of bounds for axis 0 with size 3"
    );
    // the clamped read still reaches sin(inf)
    assert!(outs[0].to_scalar().unwrap().is_nan());
    assert_eq!(
        error.messages(),
        vec![
            "out-of-bounds indexing: index {1} is out of bounds for axis {2} with size {3}",
            "nan generated by primitive sin",
        ]
    );
}

#[test]
fn test_nan_reported_when_index_in_range() {
    let f = Function::build(1, |b, p| {
        let y = b.take(&p[0], 2.0);
        vec![b.sin(y)]
    });
    let checked = checkify(&f, ErrorSet::AUTOMATIC_CHECKS).unwrap();
    let (error, _) = checked.call(&[vector(&[0.0, 1.0, f64::INFINITY])]).unwrap();
    assert_eq!(error.get().as_deref(), Some("nan generated by primitive sin"));
}

// =============================================================================
// Loop accumulation
// =============================================================================

fn reciprocal_scan() -> Function {
    // y = 1 / (carry - 1); carry += x
    let body = Function::build(2, |b, p| {
        let shifted = b.sub(&p[0], 1.0);
        let y = b.div(1.0, shifted);
        let carry = b.add(&p[0], &p[1]);
        vec![carry, y]
    });
    Function::build(2, |b, p| {
        b.scan(body, 2, Vec::new(), vec![p[0].clone()], vec![p[1].clone()])
    })
}

#[test]
fn test_scan_reports_first_iteration_fault() {
    let f = reciprocal_scan();
    let args = [scalar(1.0), vector(&[1.0, 1.0])];
    let checked = checkify(&f, ErrorSet::FLOAT_CHECKS).unwrap();
    let (error, outs) = checked.call(&args).unwrap();

    let message = error.get().unwrap();
    assert!(message.starts_with("division by zero"), "{message}");
    assert_eq!(outs, eval(&f, &args).unwrap());
    assert_eq!(outs[0], scalar(3.0));
    assert_eq!(outs[1], vector(&[f64::INFINITY, 1.0]));
}

#[test]
fn test_scan_without_fault_is_clean() {
    let f = reciprocal_scan();
    let args = [scalar(2.0), vector(&[1.0, 1.0])];
    let checked = checkify(&f, ErrorSet::FLOAT_CHECKS).unwrap();
    let (error, outs) = checked.call(&args).unwrap();
    assert!(error.get().is_none());
    assert_eq!(outs, eval(&f, &args).unwrap());
}

// =============================================================================
// Dynamic loops
// =============================================================================

#[test]
fn test_while_predicate_checked_before_body() {
    let cond = Function::build(2, |b, p| {
        let s = b.sin(&p[0]);
        vec![b.lt(s, 2.0)]
    });
    let body = Function::build(2, |b, p| vec![p[0].clone(), b.cos(&p[1])]);
    let f = Function::build(2, |b, p| {
        b.while_loop(cond, body, Vec::new(), Vec::new(), p.to_vec())
    });
    let checked = checkify(&f, ErrorSet::FLOAT_CHECKS).unwrap();
    let (error, outs) = checked
        .call(&[scalar(f64::INFINITY), scalar(f64::INFINITY)])
        .unwrap();

    let message = error.get().unwrap();
    assert!(message.starts_with("nan generated by primitive sin"), "{message}");
    assert_eq!(outs[1], scalar(f64::INFINITY));
    assert_eq!(
        checked.messages(),
        vec!["nan generated by primitive sin", "nan generated by primitive cos"]
    );
}

// =============================================================================
// Batched replicas
// =============================================================================

#[test]
fn test_vmap_reports_every_replica() {
    let f = Function::build(2, |b, p| vec![b.take(&p[0], &p[1])]);
    let checked = checkify(&f, ErrorSet::INDEX_CHECKS)
        .unwrap()
        .vmap(vec![false, true])
        .unwrap();
    let (error, outs) = checked
        .call(&[vector(&[1.0, 2.0, 3.0]), vector(&[5.0, 100.0])])
        .unwrap();

    let message = error.get().unwrap();
    assert!(message.contains("index 5"), "{message}");
    assert!(message.contains("index 100"), "{message}");
    assert_eq!(
        message,
        "at mapped index 0: out-of-bounds indexing: index 5 is out of bounds for axis 0 with size 3\n\
         at mapped index 1: out-of-bounds indexing: index 100 is out of bounds for axis 0 with size 3"
    );
    assert_eq!(error.batch_shape(), &[2]);
    assert_eq!(outs[0], vector(&[3.0, 3.0]));
}

// =============================================================================
// Re-discharge
// =============================================================================

fn reciprocal() -> Function {
    Function::build(1, |b, p| vec![b.div(1.0, &p[0])])
}

#[test]
fn test_check_error_is_idempotent_across_a_boundary() {
    let checked = checkify(&reciprocal(), ErrorSet::FLOAT_CHECKS).unwrap();

    let (error, _) = checked.call(&[scalar(0.0)]).unwrap();
    let [flag, code, payload] = error.channels();
    let crossed = Error::from_channels(error.schema().clone(), &flag, &code, &payload).unwrap();

    let first = check_error(&crossed).unwrap_err();
    let second = check_error(&crossed).unwrap_err();
    assert_eq!(first.message(), "division by zero");
    assert_eq!(first, second);

    let (clean, _) = checked.call(&[scalar(4.0)]).unwrap();
    assert!(check_error(&clean).is_ok());
    assert!(check_error(&clean).is_ok());
}

/// `x -> checked(x)` with the captured error passed through an identity call
/// and re-raised twice.
fn reraise_twice() -> Function {
    let inner = checkify(&reciprocal(), ErrorSet::FLOAT_CHECKS).unwrap();
    let mut b = FunctionBuilder::new();
    let x = b.param();
    let (error, outs) = b.call_checked(&inner, vec![x]);
    let passed = b.call(
        Function::identity(3),
        vec![error.flag.clone(), error.code.clone(), error.payload.clone()],
    );
    let passed = checkflow::ErrorChannel {
        flag: passed[0].clone(),
        code: passed[1].clone(),
        payload: passed[2].clone(),
    };
    b.check_error(&passed, &inner);
    b.check_error(&passed, &inner);
    b.finish(outs)
}

#[test]
fn test_in_program_reraise_raises_once_observed() {
    let f = reraise_twice();
    let err = eval(&f, &[scalar(0.0)]).unwrap_err();
    assert_eq!(
        err,
        EvalError::CheckFailed {
            message: "division by zero".to_string()
        }
    );
    assert_eq!(eval(&f, &[scalar(2.0)]).unwrap(), vec![scalar(0.5)]);
}

#[test]
fn test_in_program_reraise_merges_under_checkify() {
    let f = reraise_twice();
    let checked = checkify(&f, ErrorSet::USER_CHECKS).unwrap();

    let (error, outs) = checked.call(&[scalar(0.0)]).unwrap();
    assert_eq!(error.get().as_deref(), Some("division by zero"));
    assert_eq!(outs, vec![scalar(f64::INFINITY)]);

    let (error, _) = checked.call(&[scalar(2.0)]).unwrap();
    assert!(error.get().is_none());
}

// =============================================================================
// Disabled checks
// =============================================================================

#[test]
fn test_disabled_checks_match_unchecked_outputs() {
    let f = Function::build(2, |b, p| {
        let q = b.div(&p[0], &p[1]);
        let y = b.take(Array::from_vec(vec![1.0, 2.0]), &p[1]);
        let positive = b.gt(&q, 0.0);
        b.check(positive, "q must be positive, got {}", vec![q.clone()]);
        vec![b.add(q, y)]
    });
    let checked = checkify(&f, ErrorSet::NONE).unwrap();
    for args in [
        [scalar(1.0), scalar(0.0)],
        [scalar(-1.0), scalar(-7.0)],
        [scalar(3.0), scalar(1.0)],
    ] {
        let (error, outs) = checked.call(&args).unwrap();
        assert!(error.get().is_none());
        assert_eq!(outs, eval(&f, &args).unwrap());
    }
}

#[test]
fn test_user_check_reports_formatted_message() {
    let f = Function::build(1, |b, p| {
        let positive = b.gt(&p[0], 0.0);
        b.check(positive, "x must be positive, got {}", vec![p[0].clone()]);
        vec![b.mul(&p[0], Atom::scalar(2.0))]
    });
    let checked = checkify(&f, ErrorSet::ALL_CHECKS).unwrap();
    let (error, outs) = checked.call(&[scalar(-3.0)]).unwrap();
    assert_eq!(error.get().as_deref(), Some("x must be positive, got -3"));
    assert_eq!(outs, vec![scalar(-6.0)]);
    assert_eq!(error.to_string(), "x must be positive, got -3");
}

/// Checked reciprocal mapped over a vector; the stacked error is re-raised
/// once outside the map.
fn reraise_stacked() -> Function {
    let inner = checkify(&reciprocal(), ErrorSet::FLOAT_CHECKS).unwrap();
    let body = Function::build(1, |b, p| {
        let (error, outs) = b.call_checked(&inner, vec![p[0].clone()]);
        vec![error.flag, error.code, error.payload, outs[0].clone()]
    });
    let mut b = FunctionBuilder::new();
    let xs = b.param();
    let outs = b.map(body, vec![true], vec![xs]);
    let stacked = checkflow::ErrorChannel {
        flag: outs[0].clone(),
        code: outs[1].clone(),
        payload: outs[2].clone(),
    };
    b.check_error(&stacked, &inner);
    b.finish(vec![outs[3].clone()])
}

#[test]
fn test_in_program_reraise_over_stacked_errors() {
    let f = reraise_stacked();
    assert_eq!(
        eval(&f, &[vector(&[2.0, 0.0, 4.0])]).unwrap_err(),
        EvalError::CheckFailed {
            message: "division by zero".to_string()
        }
    );

    let checked = checkify(&f, ErrorSet::USER_CHECKS).unwrap();
    let (error, outs) = checked.call(&[vector(&[2.0, 0.0, 4.0])]).unwrap();
    assert!(!error.is_batched());
    assert_eq!(error.get().as_deref(), Some("division by zero"));
    assert_eq!(outs, vec![vector(&[0.5, f64::INFINITY, 0.25])]);

    let (error, outs) = checked.call(&[vector(&[2.0, 1.0, 4.0])]).unwrap();
    assert!(error.get().is_none());
    assert_eq!(outs, vec![vector(&[0.5, 1.0, 0.25])]);
}

// =============================================================================
// Enabled error sets
// =============================================================================

/// Division by zero, then NaN, then an out-of-bounds read, then a failing
/// check, each feeding the next.
fn faults_then_check() -> Function {
    Function::build(1, |b, p| {
        let x = b.div(&p[0], 0.0);
        let x = b.sin(x);
        let x = b.take(x, 500.0);
        let negative = b.lt(&x, 0.0);
        b.check(negative, "must be negative!", Vec::new());
        vec![x]
    })
}

/// A failing check first, followed by the same three faults.
fn check_then_faults() -> Function {
    Function::build(1, |b, p| {
        let negative = b.lt(&p[0], 0.0);
        let all_negative = b.reduce_all(negative);
        b.check(all_negative, "must be negative!", Vec::new());
        let x = b.div(&p[0], 0.0);
        let x = b.sin(x);
        vec![b.take(x, 500.0)]
    })
}

#[test]
fn test_empty_error_set_reports_nothing() {
    let f = faults_then_check();
    let ones = vector(&[1.0, 1.0]);
    assert!(matches!(
        eval(&f, &[ones.clone()]),
        Err(EvalError::CheckFailed { .. })
    ));

    let checked = checkify(&f, ErrorSet::NONE).unwrap();
    assert!(checked.messages().is_empty());
    let (error, outs) = checked.call(&[ones]).unwrap();
    assert!(error.get().is_none());
    assert!(check_error(&error).is_ok());
    assert!(outs[0].to_scalar().unwrap().is_nan());
}

#[test]
fn test_enabled_set_selects_first_error() {
    let f = check_then_faults();
    let ones = vector(&[1.0, 1.0]);
    let cases: Vec<(ErrorSet, &str)> = vec![
        (ErrorSet::USER_CHECKS, "must be negative!"),
        (ErrorCategory::Div.into(), "division by zero"),
        (ErrorCategory::Nan.into(), "nan generated by primitive sin"),
        (
            ErrorSet::INDEX_CHECKS,
            "out-of-bounds indexing: index 500 is out of bounds for axis 0 with size 2",
        ),
        (ErrorSet::AUTOMATIC_CHECKS, "division by zero"),
        (ErrorSet::ALL_CHECKS, "must be negative!"),
    ];
    for (errors, expected) in cases {
        let checked = checkify(&f, errors).unwrap();
        let (error, _) = checked.call(&[ones.clone()]).unwrap();
        assert_eq!(error.get().as_deref(), Some(expected), "errors = {errors:?}");
    }
}
