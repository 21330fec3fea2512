//! End-to-end lowering tests: build a traced graph, lower it against a
//! packed parameter store, and run the emitted IR through the reference
//! evaluator.

use qnn_lower::{
    graph::{build::GraphBuilder, OpKind},
    lower,
    params::pack_quant_params,
    qir::QirNode,
    tensor::Tensor,
    LowerError,
};
use std::collections::BTreeMap;

fn store_with(entries: Vec<(&str, Vec<u8>)>) -> BTreeMap<String, Vec<u8>> {
    entries
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

fn count_nodes(graph: &qnn_lower::qir::QirGraph, pred: impl Fn(&QirNode) -> bool) -> usize {
    graph.nodes.values().filter(|n| pred(n)).count()
}

#[test]
fn conv2d_1x1_matches_hand_computation() {
    // Input domain: scale 0.5, zero point 128. Weight: scale 0.25, zero
    // point 0, single quantized value 4 (real 1.0). Output domain 1.0/0.
    let mut b = GraphBuilder::new();
    let x = b.input();
    let q = b.quantize_per_tensor(x, 0.5, 128);
    let c = b.conv2d(q, "features.0._packed_params", (1, 1), (0, 0), (1, 1), 1, 1.0, 0, false);
    b.output(c);

    let store = store_with(vec![(
        "features.0._packed_params",
        pack_quant_params(&[1, 1, 1, 1], &[0.25], &[0], &[4], None),
    )]);
    let lowered = lower(b.finish(), &store).unwrap();

    // Real 1.0 quantizes to 130; accumulator (130-128)*4 = 8 at scale
    // 0.125 requantizes to 1.
    let input = Tensor::construct(vec![1.0], vec![1, 1, 1, 1]);
    let out = lowered.qir.evaluate(&[input], &lowered.params);
    assert_eq!(out[0].data(), &[1.0]);
}

#[test]
fn conv2d_padding_fills_with_input_zero_point() {
    let mut b = GraphBuilder::new();
    let x = b.input();
    let q = b.quantize_per_tensor(x, 0.5, 128);
    let c = b.conv2d(q, "features.0._packed_params", (1, 1), (1, 1), (1, 1), 1, 1.0, 0, false);
    b.output(c);

    let store = store_with(vec![(
        "features.0._packed_params",
        pack_quant_params(&[1, 1, 1, 1], &[0.25], &[0], &[4], None),
    )]);
    let lowered = lower(b.finish(), &store).unwrap();

    let input = Tensor::construct(vec![1.0], vec![1, 1, 1, 1]);
    let out = lowered.qir.evaluate(&[input], &lowered.params);
    // Padded positions hold the zero point, so they contribute nothing.
    assert_eq!(out[0].dims(), &[1, 1, 3, 3]);
    assert_eq!(out[0].data().iter().sum::<f64>(), 1.0);
    assert_eq!(out[0].data()[4], 1.0);
}

#[test]
fn linear_relu_applies_bias_in_accumulator_domain() {
    let mut b = GraphBuilder::new();
    let x = b.input();
    let q = b.quantize_per_tensor(x, 0.5, 0);
    let fc = b.linear(q, "fc._packed_params", 1.0, 0, true);
    b.output(fc);

    // Weight [1,2], scale 0.5, values (2, 2) => real (1.0, 1.0); bias 1.0.
    let store = store_with(vec![(
        "fc._packed_params",
        pack_quant_params(&[1, 2], &[0.5], &[0], &[2, 2], Some(&[1.0])),
    )]);
    let lowered = lower(b.finish(), &store).unwrap();
    assert!(lowered.params.contains_key("fc_weight"));
    assert!(lowered.params.contains_key("fc_bias"));

    // Real (1, 2) . (1, 1) + 1 = 4; output domain has scale 1.0.
    let input = Tensor::construct(vec![1.0, 2.0], vec![1, 2]);
    let out = lowered.qir.evaluate(&[input], &lowered.params);
    assert_eq!(out[0].data(), &[4.0]);
}

#[test]
fn binop_reuses_pre_quantization_values() {
    let mut b = GraphBuilder::new();
    let x = b.input();
    let q = b.quantize_per_tensor(x, 0.5, 0);
    let add = b.binop(OpKind::Add, q, q, 1.0, 0);
    b.output(add);

    let lowered = lower(b.finish(), &BTreeMap::new()).unwrap();
    // Both operands came straight out of a quantize step, so neither side
    // needs a round-trip through the quantized domain.
    assert_eq!(
        count_nodes(&lowered.qir, |n| matches!(n, QirNode::Dequantize { .. })),
        0
    );

    let input = Tensor::from_vec(vec![3.0]);
    let out = lowered.qir.evaluate(&[input], &lowered.params);
    assert_eq!(out[0].data(), &[6.0]);
}

#[test]
fn binop_dequantizes_operands_without_a_quantize_producer() {
    let mut b = GraphBuilder::new();
    let x = b.input();
    let q = b.quantize_per_tensor(x, 0.5, 0);
    let r6 = b.relu6(q);
    let add = b.binop(OpKind::Add, r6, q, 1.0, 0);
    b.output(add);

    let lowered = lower(b.finish(), &BTreeMap::new()).unwrap();
    // The clipped operand needs an explicit dequantize; the other side
    // still reuses its pre-quantization value.
    assert_eq!(
        count_nodes(&lowered.qir, |n| matches!(n, QirNode::Dequantize { .. })),
        1
    );

    let input = Tensor::from_vec(vec![2.0]);
    let out = lowered.qir.evaluate(&[input], &lowered.params);
    assert_eq!(out[0].data(), &[4.0]);
}

#[test]
fn cat_with_identical_params_preserves_values() {
    let mut b = GraphBuilder::new();
    let x = b.input();
    let y = b.input();
    let qx = b.quantize_per_tensor(x, 0.5, 10);
    let qy = b.quantize_per_tensor(y, 0.5, 10);
    let cat = b.cat(vec![qx, qy], 0, 0.5, 10);
    b.output(cat);

    let lowered = lower(b.finish(), &BTreeMap::new()).unwrap();
    let out = lowered.qir.evaluate(
        &[Tensor::from_vec(vec![1.0]), Tensor::from_vec(vec![2.0])],
        &lowered.params,
    );
    // Matching input and output domains make the round-trip exact.
    assert_eq!(out[0].dims(), &[2]);
    assert_eq!(out[0].data(), &[12.0, 14.0]);
}

#[test]
fn cat_round_trips_random_batches() {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    let mut b = GraphBuilder::new();
    let x = b.input();
    let y = b.input();
    let qx = b.quantize_per_tensor(x, 0.25, 64);
    let qy = b.quantize_per_tensor(y, 0.25, 64);
    let cat = b.cat(vec![qx, qy], 0, 0.25, 64);
    b.output(cat);
    let lowered = lower(b.finish(), &BTreeMap::new()).unwrap();

    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..50 {
        // Values inside the representable range of the 0.25/64 domain.
        let a: f64 = rng.gen_range(-16.0..47.0);
        let c: f64 = rng.gen_range(-16.0..47.0);
        let out = lowered.qir.evaluate(
            &[Tensor::from_vec(vec![a]), Tensor::from_vec(vec![c])],
            &lowered.params,
        );
        let expect = |v: f64| (64.0 + v / 0.25).round().clamp(0.0, 255.0);
        assert_eq!(out[0].data(), &[expect(a), expect(c)]);
    }
}

#[test]
fn relu6_clips_between_zero_point_and_quantized_six() {
    let mut b = GraphBuilder::new();
    let x = b.input();
    let q = b.quantize_per_tensor(x, 0.5, 0);
    let r = b.relu6(q);
    b.output(r);

    let lowered = lower(b.finish(), &BTreeMap::new()).unwrap();
    let input = Tensor::from_vec(vec![-1.0, 3.0, 10.0]);
    let out = lowered.qir.evaluate(&[input], &lowered.params);
    // 6.0 quantizes to 12 in this domain.
    assert_eq!(out[0].data(), &[0.0, 6.0, 12.0]);
}

#[test]
fn add_scalar_in_range_emits_no_arithmetic() {
    let mut b = GraphBuilder::new();
    let x = b.input();
    let q = b.quantize_per_tensor(x, 0.1, 250);
    let a = b.add_scalar(q, 3.0);
    b.output(a);

    let lowered = lower(b.finish(), &BTreeMap::new()).unwrap();
    // The shift 250 - 30 stays in range, so only the descriptor changed.
    assert_eq!(
        count_nodes(&lowered.qir, |n| matches!(n, QirNode::Add { .. })),
        0
    );

    let input = Tensor::from_vec(vec![0.0]);
    let out = lowered.qir.evaluate(&[input], &lowered.params);
    assert_eq!(out[0].data(), &[250.0]);
}

#[test]
fn add_scalar_out_of_range_requantizes() {
    let mut b = GraphBuilder::new();
    let x = b.input();
    let q = b.quantize_per_tensor(x, 0.1, 250);
    let a = b.add_scalar(q, 30.0);
    b.output(a);

    let lowered = lower(b.finish(), &BTreeMap::new()).unwrap();
    assert_eq!(
        count_nodes(&lowered.qir, |n| matches!(n, QirNode::Add { .. })),
        1
    );

    // Output domain: zero point clamped to 0, scale stretched to
    // 305/255 * 0.1. Real 0.5 sits at the top of the input range and maps
    // to 255; real -25.0 maps through (5.0 / out_scale).round() = 42.
    let input = Tensor::from_vec(vec![0.5, -25.0]);
    let out = lowered.qir.evaluate(&[input], &lowered.params);
    assert_eq!(out[0].data(), &[255.0, 42.0]);
}

#[test]
fn mul_scalar_is_a_pure_rescale() {
    let mut b = GraphBuilder::new();
    let x = b.input();
    let q = b.quantize_per_tensor(x, 0.5, 0);
    let m = b.mul_scalar(q, 2.0);
    b.output(m);

    let lowered = lower(b.finish(), &BTreeMap::new()).unwrap();
    assert_eq!(
        count_nodes(&lowered.qir, |n| matches!(n, QirNode::Multiply { .. })),
        0
    );

    // Stored value 6 is untouched; it now reads as 6 * 1.0 = 6.0 = 3 * 2.
    let input = Tensor::from_vec(vec![3.0]);
    let out = lowered.qir.evaluate(&[input], &lowered.params);
    assert_eq!(out[0].data(), &[6.0]);
}

#[test]
fn dequantize_resolves_params_through_producer() {
    let mut b = GraphBuilder::new();
    let x = b.input();
    let q = b.quantize_per_tensor(x, 0.5, 128);
    let c = b.conv2d(q, "features.0._packed_params", (1, 1), (0, 0), (1, 1), 1, 0.5, 3, false);
    let d = b.dequantize(c);
    b.output(d);

    let store = store_with(vec![(
        "features.0._packed_params",
        pack_quant_params(&[1, 1, 1, 1], &[0.25], &[0], &[4], None),
    )]);
    let lowered = lower(b.finish(), &store).unwrap();

    // Accumulator 8 at scale 0.125 lands on 2 + 3 in the 0.5/3 output
    // domain, which dequantizes back to the real result 1.0.
    let input = Tensor::construct(vec![1.0], vec![1, 1, 1, 1]);
    let out = lowered.qir.evaluate(&[input], &lowered.params);
    assert_eq!(out[0].data(), &[1.0]);
}

#[test]
fn missing_packed_param_fails_lowering() {
    let mut b = GraphBuilder::new();
    let x = b.input();
    let q = b.quantize_per_tensor(x, 0.5, 128);
    let c = b.conv2d(q, "gone._packed_params", (1, 1), (0, 0), (1, 1), 1, 1.0, 0, false);
    b.output(c);

    let err = lower(b.finish(), &BTreeMap::new()).unwrap_err();
    assert!(matches!(err, LowerError::Invariant { .. }));
}

#[test]
fn corrupt_store_entry_fails_lowering() {
    let mut b = GraphBuilder::new();
    let x = b.input();
    b.output(x);

    let store = store_with(vec![("bad._packed_params", vec![0xff; 3])]);
    let err = lower(b.finish(), &store).unwrap_err();
    assert!(matches!(err, LowerError::Decode { .. }));
}
