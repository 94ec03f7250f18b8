//! Error threading through control-flow constructs and replication.

use checkflow::{
    checkify, checkify_with, eval, Array, Atom, CheckRegistry, CheckifyConfig, CheckifyError, ErrorSet,
    Function, ReplicaErrors, WhileInMap,
};

fn scalar(x: f64) -> Array {
    Array::scalar(x)
}

fn vector(values: &[f64]) -> Array {
    Array::from_vec(values.to_vec())
}

// =============================================================================
// Branches
// =============================================================================

fn reciprocal_or_root() -> Function {
    let on_true = Function::build(1, |b, p| vec![b.div(1.0, &p[0])]);
    let on_false = Function::build(1, |b, p| vec![b.sqrt(&p[0])]);
    Function::build(2, |b, p| b.cond(&p[0], on_true, on_false, vec![p[1].clone()]))
}

#[test]
fn test_cond_reports_only_taken_branch() {
    let checked = checkify(&reciprocal_or_root(), ErrorSet::FLOAT_CHECKS).unwrap();

    let (error, _) = checked.call(&[Array::from_bool(true), scalar(0.0)]).unwrap();
    assert_eq!(error.get().as_deref(), Some("division by zero"));

    let (error, _) = checked.call(&[Array::from_bool(false), scalar(-1.0)]).unwrap();
    assert_eq!(error.get().as_deref(), Some("nan generated by primitive sqrt"));

    let (error, outs) = checked.call(&[Array::from_bool(true), scalar(-1.0)]).unwrap();
    assert!(error.get().is_none());
    assert_eq!(outs, vec![scalar(-1.0)]);
}

#[test]
fn test_cond_messages_cover_every_branch() {
    let checked = checkify(&reciprocal_or_root(), ErrorSet::FLOAT_CHECKS).unwrap();
    assert_eq!(
        checked.messages(),
        vec![
            "nan generated by primitive sqrt",
            "division by zero",
            "nan generated by primitive div",
        ]
    );
}

#[test]
fn test_switch_threads_selected_branch() {
    let branches: Vec<Function> = (0..3)
        .map(|k| {
            Function::build(1, move |b, p| {
                if k == 1 {
                    let positive = b.gt(&p[0], 0.0);
                    b.check(positive, "branch one needs positive x, got {}", vec![p[0].clone()]);
                }
                vec![b.add(&p[0], k as f64)]
            })
        })
        .collect();
    let f = Function::build(2, |b, p| b.switch(&p[0], branches, vec![p[1].clone()]));
    let checked = checkify(&f, ErrorSet::USER_CHECKS).unwrap();

    let (error, outs) = checked.call(&[scalar(1.0), scalar(-1.0)]).unwrap();
    assert_eq!(error.get().as_deref(), Some("branch one needs positive x, got -1"));
    assert_eq!(outs, vec![scalar(0.0)]);

    for index in [0.0, 2.0, 9.0] {
        let (error, _) = checked.call(&[scalar(index), scalar(-1.0)]).unwrap();
        assert!(error.get().is_none(), "branch {index}");
    }
}

// =============================================================================
// Loops
// =============================================================================

#[test]
fn test_while_checks_terminating_predicate() {
    // counts x up to 3; the predicate divides by (x - 3)
    let cond = Function::build(1, |b, p| {
        let gap = b.sub(&p[0], 3.0);
        let _ = b.div(1.0, gap);
        vec![b.lt(&p[0], 3.0)]
    });
    let body = Function::build(1, |b, p| vec![b.add(&p[0], 1.0)]);
    let f = Function::build(1, |b, p| {
        b.while_loop(cond, body, Vec::new(), Vec::new(), p.to_vec())
    });
    let checked = checkify(&f, ErrorSet::FLOAT_CHECKS).unwrap();

    let (error, outs) = checked.call(&[scalar(0.0)]).unwrap();
    assert_eq!(error.get().as_deref(), Some("division by zero"));
    assert_eq!(outs, vec![scalar(3.0)]);

    let (error, outs) = checked.call(&[scalar(3.5)]).unwrap();
    assert!(error.get().is_none());
    assert_eq!(outs, vec![scalar(3.5)]);
}

#[test]
fn test_while_with_consts_matches_unchecked() {
    let cond = Function::build(2, |b, p| vec![b.lt(&p[1], &p[0])]);
    let body = Function::build(2, |b, p| {
        let step = b.div(&p[0], 2.0);
        vec![b.add(&p[1], step)]
    });
    let f = Function::build(2, |b, p| {
        b.while_loop(cond, body, vec![p[0].clone()], vec![p[1].clone()], vec![Atom::scalar(0.0)])
    });
    let checked = checkify(&f, ErrorSet::ALL_CHECKS).unwrap();
    let args = [scalar(10.0), scalar(4.0)];
    let (error, outs) = checked.call(&args).unwrap();
    assert!(error.get().is_none());
    assert_eq!(outs, eval(&f, &args).unwrap());
    assert_eq!(outs, vec![scalar(10.0)]);
}

#[test]
fn test_scan_with_consts_reports_later_iteration() {
    // y = c / x for each x
    let body = Function::build(3, |b, p| {
        let y = b.div(&p[0], &p[2]);
        let carry = b.add(&p[1], 1.0);
        vec![carry, y]
    });
    let f = Function::build(2, |b, p| {
        b.scan(body, 3, vec![p[0].clone()], vec![Atom::scalar(0.0)], vec![p[1].clone()])
    });
    let checked = checkify(&f, ErrorSet::FLOAT_CHECKS).unwrap();
    let (error, outs) = checked.call(&[scalar(6.0), vector(&[1.0, 2.0, 0.0])]).unwrap();
    assert_eq!(error.get().as_deref(), Some("division by zero"));
    assert_eq!(outs[0], scalar(3.0));
    assert_eq!(outs[1], vector(&[6.0, 3.0, f64::INFINITY]));
}

// =============================================================================
// Maps inside the program
// =============================================================================

fn map_of_while() -> Function {
    let cond = Function::build(1, |b, p| vec![b.lt(&p[0], 10.0)]);
    let body = Function::build(1, |b, p| vec![b.div(&p[0], 0.5)]);
    let per_item = Function::build(1, |b, p| {
        b.while_loop(cond, body, Vec::new(), Vec::new(), p.to_vec())
    });
    Function::build(1, |b, p| b.map(per_item, vec![true], p.to_vec()))
}

#[test]
fn test_map_of_checked_while_is_rejected_by_default() {
    let err = checkify(&map_of_while(), ErrorSet::FLOAT_CHECKS).unwrap_err();
    match err {
        CheckifyError::Composition { combination, .. } => {
            assert_eq!(combination, "checkify-of-map-of-while");
        }
        other => panic!("expected composition error, got {other}"),
    }
}

#[test]
fn test_map_of_unchecked_while_is_accepted() {
    let checked = checkify(&map_of_while(), ErrorSet::INDEX_CHECKS).unwrap();
    let (error, outs) = checked.call(&[vector(&[1.0, 20.0])]).unwrap();
    assert!(error.get().is_none());
    assert_eq!(outs, vec![vector(&[16.0, 20.0])]);
}

#[test]
fn test_masked_policy_runs_replicas_independently() {
    let config = CheckifyConfig::new(ErrorSet::FLOAT_CHECKS).with_while_in_map(WhileInMap::Masked);
    let checked = checkify_with(&map_of_while(), &config, &CheckRegistry::builtin()).unwrap();
    let (error, outs) = checked.call(&[vector(&[1.0, 20.0, 3.0])]).unwrap();
    assert!(error.get().is_none());
    assert_eq!(outs, vec![vector(&[16.0, 20.0, 12.0])]);
}

#[test]
fn test_map_reduces_to_first_faulting_replica() {
    let body = Function::build(1, |b, p| vec![b.div(1.0, &p[0])]);
    let f = Function::build(1, |b, p| b.map(body, vec![true], p.to_vec()));
    let checked = checkify(&f, ErrorSet::FLOAT_CHECKS).unwrap();
    let (error, outs) = checked.call(&[vector(&[2.0, 0.0, 4.0])]).unwrap();
    // an in-program map folds replicas into one error
    assert!(!error.is_batched());
    assert_eq!(error.get().as_deref(), Some("division by zero"));
    assert_eq!(outs, vec![vector(&[0.5, f64::INFINITY, 0.25])]);
}

// =============================================================================
// Replicating a checked function
// =============================================================================

fn row_lookup() -> Function {
    Function::build(2, |b, p| vec![b.take(&p[0], &p[1])])
}

fn rows() -> Array {
    Array::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap()
}

#[test]
fn test_vmap_keeps_clean_replicas_silent() {
    let checked = checkify(&row_lookup(), ErrorSet::INDEX_CHECKS)
        .unwrap()
        .vmap(vec![true, true])
        .unwrap();
    let (error, outs) = checked.call(&[rows(), vector(&[0.0, 7.0])]).unwrap();
    assert_eq!(
        error.get().as_deref(),
        Some("at mapped index 1: out-of-bounds indexing: index 7 is out of bounds for axis 0 with size 3")
    );
    assert_eq!(outs, vec![vector(&[1.0, 6.0])]);
    assert_eq!(checked.replica_errors(), Some(ReplicaErrors::PerReplica));
}

#[test]
fn test_vmap_reduce_override() {
    let config = CheckifyConfig::new(ErrorSet::INDEX_CHECKS).with_replica_errors(ReplicaErrors::Reduce);
    let checked = checkify_with(&row_lookup(), &config, &CheckRegistry::builtin())
        .unwrap()
        .vmap(vec![false, true])
        .unwrap();
    let (error, _) = checked
        .call(&[vector(&[1.0, 2.0, 3.0]), vector(&[1.0, -4.0, 9.0])])
        .unwrap();
    assert!(!error.is_batched());
    assert_eq!(
        error.get().as_deref(),
        Some("out-of-bounds indexing: index -1 is out of bounds for axis 0 with size 3")
    );
}

#[test]
fn test_shard_reduces_by_default() {
    let checked = checkify(&row_lookup(), ErrorSet::INDEX_CHECKS)
        .unwrap()
        .shard(2, vec![true, true])
        .unwrap();
    assert_eq!(checked.replica_errors(), Some(ReplicaErrors::Reduce));
    let (error, outs) = checked.call(&[rows(), vector(&[0.0, 7.0])]).unwrap();
    assert_eq!(
        error.get().as_deref(),
        Some("out-of-bounds indexing: index 7 is out of bounds for axis 0 with size 3")
    );
    assert_eq!(outs, vec![vector(&[1.0, 6.0])]);
}

#[test]
fn test_shard_per_replica_override() {
    let config =
        CheckifyConfig::new(ErrorSet::INDEX_CHECKS).with_replica_errors(ReplicaErrors::PerReplica);
    let checked = checkify_with(&row_lookup(), &config, &CheckRegistry::builtin())
        .unwrap()
        .shard(2, vec![true, true])
        .unwrap();
    let (error, _) = checked.call(&[rows(), vector(&[3.0, 1.0])]).unwrap();
    assert!(error.is_batched());
    assert_eq!(
        error.get().as_deref(),
        Some("at mapped index 0: out-of-bounds indexing: index 3 is out of bounds for axis 0 with size 3")
    );
}

#[test]
fn test_shard_count_must_match_leading_axis() {
    let checked = checkify(&row_lookup(), ErrorSet::INDEX_CHECKS)
        .unwrap()
        .shard(3, vec![true, true])
        .unwrap();
    assert!(checked.call(&[rows(), vector(&[0.0, 1.0])]).is_err());
}

#[test]
fn test_replication_validates_mapped_flags() {
    let checked = checkify(&row_lookup(), ErrorSet::INDEX_CHECKS).unwrap();
    assert!(matches!(checked.vmap(vec![true]), Err(CheckifyError::Invalid(_))));
    assert!(matches!(
        checked.vmap(vec![false, false]),
        Err(CheckifyError::Invalid(_))
    ));
}

#[test]
fn test_vmap_of_checked_while_is_allowed() {
    let cond = Function::build(1, |b, p| vec![b.lt(&p[0], 10.0)]);
    let body = Function::build(1, |b, p| vec![b.div(&p[0], 0.5)]);
    let f = Function::build(1, |b, p| {
        b.while_loop(cond, body, Vec::new(), Vec::new(), p.to_vec())
    });
    let checked = checkify(&f, ErrorSet::FLOAT_CHECKS)
        .unwrap()
        .vmap(vec![true])
        .unwrap();
    let (error, outs) = checked.call(&[vector(&[1.0, 20.0])]).unwrap();
    assert!(error.get().is_none());
    assert_eq!(outs, vec![vector(&[16.0, 20.0])]);
}

// =============================================================================
// Nesting
// =============================================================================

/// Running sum over rows of the element-wise reciprocal, computed with a map.
fn scan_of_reciprocal_map() -> Function {
    let body = Function::build(2, |b, p| {
        let reciprocal = Function::build(1, |b, q| vec![b.div(1.0, &q[0])]);
        let ys = b.map(reciprocal, vec![true], vec![p[1].clone()]);
        let total = b.reduce_sum(&ys[0]);
        vec![b.add(&p[0], total), ys[0].clone()]
    });
    Function::build(1, |b, p| {
        b.scan(body, 2, Vec::new(), vec![Atom::scalar(0.0)], vec![p[0].clone()])
    })
}

#[test]
fn test_scan_of_map_matches_unchecked_outputs() {
    let f = scan_of_reciprocal_map();
    let checked = checkify(&f, ErrorSet::FLOAT_CHECKS).unwrap();

    let clean = Array::new(vec![2, 3], vec![1.0, 2.0, 4.0, 4.0, 2.0, 1.0]).unwrap();
    let (error, outs) = checked.call(&[clean.clone()]).unwrap();
    assert!(error.get().is_none());
    assert_eq!(outs, eval(&f, &[clean]).unwrap());
    assert_eq!(outs[0], scalar(3.5));

    let faulty = Array::new(vec![2, 3], vec![1.0, 2.0, 4.0, 0.0, 2.0, 1.0]).unwrap();
    let (error, outs) = checked.call(&[faulty.clone()]).unwrap();
    assert_eq!(error.get().as_deref(), Some("division by zero"));
    assert_eq!(outs, eval(&f, &[faulty]).unwrap());
}
