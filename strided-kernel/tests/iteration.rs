use approx::assert_relative_eq;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use strided_kernel::{
    assign_array, for_each_run, IterConfig, IterOperand, MaskUse, NdIter, Result,
};
use strided_view::{row_major_byte_strides, Casting, DType, StridedArray};

/// Array of `dims` whose axes are laid out in the random memory order `perm`
/// (perm[0] outermost), holding `value(idx)`.
fn permuted_array(dims: &[usize], perm: &[usize], value: impl Fn(&[usize]) -> f64) -> StridedArray {
    let mut strides = vec![0isize; dims.len()];
    let mut s = 8isize;
    for &axis in perm.iter().rev() {
        strides[axis] = s;
        s *= dims[axis] as isize;
    }
    let a = StridedArray::with_layout(DType::F64, dims, &strides).unwrap();
    let mut idx = vec![0usize; dims.len()];
    loop {
        a.set(&idx, value(&idx));
        let mut axis = dims.len();
        loop {
            if axis == 0 {
                return a;
            }
            axis -= 1;
            idx[axis] += 1;
            if idx[axis] < dims[axis] {
                break;
            }
            idx[axis] = 0;
        }
    }
}

fn random_case(rng: &mut StdRng) -> (Vec<usize>, Vec<usize>) {
    let rank = rng.gen_range(1..=4);
    let dims: Vec<usize> = (0..rank).map(|_| rng.gen_range(1..=5)).collect();
    let mut perm: Vec<usize> = (0..rank).collect();
    perm.shuffle(rng);
    (dims, perm)
}

fn value(idx: &[usize]) -> f64 {
    idx.iter().fold(0.0, |acc, &i| acc * 7.0 + i as f64 + 0.5)
}

#[test]
fn test_for_each_run_visits_every_offset_once() {
    let mut rng = StdRng::seed_from_u64(1);
    for _ in 0..20 {
        let (dims, perm) = random_case(&mut rng);
        let a = permuted_array(&dims, &perm, value);
        let mut seen = vec![0u32; a.len()];
        for_each_run::<(), _>(a.dims(), &[a.strides()], None, |offsets, len, inner| {
            for i in 0..len as isize {
                seen[((offsets[0] + i * inner[0]) / 8) as usize] += 1;
            }
            Ok(())
        })
        .unwrap();
        assert!(seen.iter().all(|&n| n == 1), "dims {dims:?} perm {perm:?}");
    }
}

#[test]
fn test_buffered_copy_across_layouts() {
    let mut rng = StdRng::seed_from_u64(2);
    for _ in 0..20 {
        let (dims, perm) = random_case(&mut rng);
        let src = permuted_array(&dims, &perm, value);
        let dst = StridedArray::zeros(DType::F32, &dims).unwrap();
        let config = IterConfig {
            buffered: true,
            buffer_size: rng.gen_range(1..=6),
            ..IterConfig::default()
        };
        let mut iter = NdIter::new(
            vec![
                IterOperand::read_write(dst.clone()).with_dtype(DType::F64),
                IterOperand::read_only(src.clone()),
            ],
            config,
        )
        .unwrap();
        loop {
            for i in 0..iter.inner_len() {
                let x: f64 = iter.read(1, i);
                iter.write(0, i, x);
            }
            if !iter.advance().unwrap() {
                break;
            }
        }
        iter.finish().unwrap();

        let expected: Vec<f32> = src.to_vec::<f64>().unwrap().iter().map(|&x| x as f32).collect();
        assert_eq!(dst.to_vec::<f32>().unwrap(), expected);
    }
}

#[test]
fn test_reduce_operand_matches_naive_sum() {
    let mut rng = StdRng::seed_from_u64(3);
    for _ in 0..20 {
        let (dims, perm) = random_case(&mut rng);
        let flags: Vec<bool> = dims.iter().map(|_| rng.gen::<bool>()).collect();
        let src = permuted_array(&dims, &perm, value);
        let out_dims: Vec<usize> = dims
            .iter()
            .zip(&flags)
            .map(|(&d, &f)| if f { 1 } else { d })
            .collect();
        let out = StridedArray::zeros(DType::F64, &out_dims).unwrap();

        let config = IterConfig {
            buffered: true,
            buffer_size: rng.gen_range(1..=4),
            ..IterConfig::default()
        };
        let mut iter = NdIter::new(
            vec![
                IterOperand::read_write(out.clone()),
                IterOperand::read_only(src.clone()).with_dtype(DType::F32),
            ],
            config,
        )
        .unwrap();
        loop {
            for i in 0..iter.inner_len() {
                let acc: f64 = iter.read(0, i);
                let x: f32 = iter.read(1, i);
                iter.write(0, i, acc + x as f64);
            }
            if !iter.advance().unwrap() {
                break;
            }
        }
        iter.finish().unwrap();

        let src_vals = src.to_vec::<f64>().unwrap();
        let mut expected = vec![0.0f64; out.len()];
        let src_strides = row_major_byte_strides(&dims, 1);
        let out_strides = row_major_byte_strides(&out_dims, 1);
        for (lin, &x) in src_vals.iter().enumerate() {
            let mut slot = 0isize;
            for axis in 0..dims.len() {
                let coord = (lin as isize / src_strides[axis]) % dims[axis] as isize;
                if !flags[axis] {
                    slot += coord * out_strides[axis];
                }
            }
            expected[slot as usize] += x as f32 as f64;
        }
        for (g, e) in out.to_vec::<f64>().unwrap().iter().zip(&expected) {
            assert_relative_eq!(*g, *e, epsilon = 1e-9);
        }
    }
}

#[test]
fn test_mask_streams_follow_data() {
    let exposed: Vec<bool> = (0..12).map(|i| i % 5 != 1).collect();
    let src = permuted_array(&[3, 4], &[1, 0], value)
        .with_mask_values(&exposed)
        .unwrap();
    let count = StridedArray::zeros(DType::I64, &[3, 1]).unwrap();
    let mut iter = NdIter::new(
        vec![
            IterOperand::read_write(count.clone()),
            IterOperand::read_only(src).mask_use(MaskUse::Use),
        ],
        IterConfig::default(),
    )
    .unwrap();
    let m = iter.mask_stream(1).unwrap();
    let step = |iter: &mut NdIter| -> Result<bool> {
        for i in 0..iter.inner_len() {
            if iter.exposed(m, i) {
                let c: i64 = iter.read(0, i);
                iter.write(0, i, c + 1);
            }
        }
        iter.advance()
    };
    while step(&mut iter).unwrap() {}
    drop(iter);

    let expected: Vec<i64> = (0..3)
        .map(|r| (0..4).filter(|c| exposed[r * 4 + c]).count() as i64)
        .collect();
    assert_eq!(count.to_vec::<i64>().unwrap(), expected);
}

#[test]
fn test_assign_array_broadcast_and_mask() {
    let src = StridedArray::from_vec(&[1, 3], vec![1i32, 2, 3])
        .unwrap()
        .with_mask_values(&[true, false, true])
        .unwrap();
    let mut dst = StridedArray::zeros(DType::I64, &[2, 3]).unwrap();
    dst.attach_mask(false).unwrap();

    assign_array(&dst, &src, Casting::Safe, false).unwrap();
    assert_eq!(dst.to_vec::<i64>().unwrap(), vec![1, 2, 3, 1, 2, 3]);
    assert_eq!(
        dst.mask_values().unwrap(),
        vec![true, false, true, true, false, true]
    );

    // preserving NA leaves hidden slots alone
    let ones = StridedArray::from_vec(&[2, 3], vec![9i64; 6]).unwrap();
    assign_array(&dst, &ones, Casting::Safe, true).unwrap();
    assert_eq!(dst.to_vec::<i64>().unwrap(), vec![9, 2, 9, 9, 2, 9]);

    let floats = StridedArray::from_vec(&[2, 3], vec![0.5f64; 6]).unwrap();
    assert!(assign_array(&dst, &floats, Casting::SameKind, false).is_err());
}
