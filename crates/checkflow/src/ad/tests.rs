//! Tests for forward-mode differentiation.

use super::*;
use crate::interpret::eval;

fn scalar(x: f64) -> Array {
    Array::scalar(x)
}

fn close(a: &Array, expected: f64) -> bool {
    (a.to_scalar().unwrap() - expected).abs() < 1e-9
}

#[test]
fn test_jvp_sin() {
    let f = Function::build(1, |b, p| vec![b.sin(&p[0])]);
    let df = jvp(&f).unwrap();
    let out = eval(&df, &[scalar(0.5), scalar(2.0)]).unwrap();
    assert!(close(&out[0], 0.5f64.sin()));
    assert!(close(&out[1], 2.0 * 0.5f64.cos()));
}

#[test]
fn test_jvp_product_and_quotient() {
    // f(x, y) = x * y / (x + 1)
    let f = Function::build(2, |b, p| {
        let num = b.mul(&p[0], &p[1]);
        let den = b.add(&p[0], 1.0);
        vec![b.div(num, den)]
    });
    let df = jvp(&f).unwrap();
    let (x, y) = (2.0, 3.0);
    let out = eval(&df, &[scalar(x), scalar(y), scalar(1.0), scalar(0.0)]).unwrap();
    let expected = y / (x + 1.0) - x * y / ((x + 1.0) * (x + 1.0));
    assert!(close(&out[1], expected));
}

#[test]
fn test_grad_of_polynomial() {
    // f(x) = x^3 + 2x
    let f = Function::build(1, |b, p| {
        let cube = b.pow(&p[0], 3.0);
        let lin = b.mul(&p[0], 2.0);
        vec![b.add(cube, lin)]
    });
    let g = grad(&f).unwrap();
    let out = eval(&g, &[scalar(2.0)]).unwrap();
    assert!(close(&out[0], 3.0 * 4.0 + 2.0));
}

#[test]
fn test_constant_output_has_dense_zero_tangent() {
    let f = Function::build(1, |_, _| vec![Atom::scalar(4.0)]);
    let df = jvp(&f).unwrap();
    let out = eval(&df, &[scalar(1.0), scalar(1.0)]).unwrap();
    assert_eq!(out, vec![scalar(4.0), scalar(0.0)]);
}

#[test]
fn test_one_sided_tangent_broadcasts() {
    // f(x) = x + [1, 2, 3] with scalar x
    let f = Function::build(1, |b, p| {
        vec![b.add(&p[0], Array::from_vec(vec![1.0, 2.0, 3.0]))]
    });
    let df = jvp(&f).unwrap();
    let out = eval(&df, &[scalar(0.0), scalar(1.0)]).unwrap();
    assert_eq!(out[1], Array::from_vec(vec![1.0, 1.0, 1.0]));
}

#[test]
fn test_jvp_through_scan() {
    // carry = carry * x for each x
    let body = Function::build(2, |b, p| vec![b.mul(&p[0], &p[1])]);
    let f = Function::build(2, |b, p| {
        b.scan(body, 3, Vec::new(), vec![p[0].clone()], vec![p[1].clone()])
    });
    let df = jvp(&f).unwrap();
    let xs = Array::from_vec(vec![2.0, 3.0, 4.0]);
    let out = eval(&df, &[scalar(1.0), xs.clone(), scalar(1.0), Array::zeros(&[3])]).unwrap();
    assert!(close(&out[0], 24.0));
    assert!(close(&out[1], 24.0));
}

#[test]
fn test_jvp_through_while() {
    // double x until it exceeds 10
    let cond = Function::build(1, |b, p| vec![b.lt(&p[0], 10.0)]);
    let body = Function::build(1, |b, p| vec![b.mul(&p[0], 2.0)]);
    let f = Function::build(1, |b, p| {
        b.while_loop(cond, body, Vec::new(), Vec::new(), vec![p[0].clone()])
    });
    let df = jvp(&f).unwrap();
    let out = eval(&df, &[scalar(3.0), scalar(1.0)]).unwrap();
    assert!(close(&out[0], 12.0));
    assert!(close(&out[1], 4.0));
}

#[test]
fn test_jvp_through_cond_and_map() {
    let on_true = Function::build(1, |b, p| vec![b.mul(&p[0], &p[0])]);
    let on_false = Function::build(1, |b, p| vec![b.neg(&p[0])]);
    let body = Function::build(1, |b, p| {
        let positive = b.gt(&p[0], 0.0);
        b.cond(positive, on_true, on_false, vec![p[0].clone()])
    });
    let f = Function::build(1, |b, p| b.map(body, vec![true], p.to_vec()));
    let df = jvp(&f).unwrap();
    let x = Array::from_vec(vec![3.0, -2.0]);
    let t = Array::from_vec(vec![1.0, 1.0]);
    let out = eval(&df, &[x, t]).unwrap();
    assert_eq!(out[0], Array::from_vec(vec![9.0, 2.0]));
    assert_eq!(out[1], Array::from_vec(vec![6.0, -1.0]));
}

#[test]
fn test_custom_jvp_uses_rule() {
    // primal: identity; rule: (x, t) -> (x, 10 t)
    let primal = Function::identity(1);
    let rule = Function::build(2, |b, p| vec![p[0].clone(), b.mul(&p[1], 10.0)]);
    let f = Function::build(1, |b, p| b.custom_jvp(primal, rule, p.to_vec()));
    let df = jvp(&f).unwrap();
    let out = eval(&df, &[scalar(2.0), scalar(1.0)]).unwrap();
    assert_eq!(out, vec![scalar(2.0), scalar(10.0)]);
    assert!(df
        .equations
        .iter()
        .all(|eq| !matches!(eq.primitive, Primitive::CustomJvp { .. })));
}

#[test]
fn test_reduce_max_splits_ties() {
    let f = Function::build(1, |b, p| vec![b.reduce(ReduceOp::Max, &p[0])]);
    let df = jvp(&f).unwrap();
    let x = Array::from_vec(vec![1.0, 5.0, 5.0]);
    let t = Array::from_vec(vec![1.0, 2.0, 4.0]);
    let out = eval(&df, &[x, t]).unwrap();
    assert!(close(&out[1], 3.0));
}

#[test]
fn test_multiplicative_update_with_tangent_is_unsupported() {
    let f = Function::build(1, |b, p| {
        vec![b.index_update(
            &p[0],
            crate::ir::IndexSpec::leading(),
            vec![Atom::scalar(0.0)],
            2.0,
            UpdateMode::Mul,
        )]
    });
    let err = jvp(&f).unwrap_err();
    assert!(matches!(err, AdError::Unsupported { primitive: "index_update", .. }));
}
