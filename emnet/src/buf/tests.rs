use proptest::prelude::*;

use super::*;

#[derive(Clone, Debug)]
enum Op {
    Write(Vec<u8>),
    Append(usize),
    Trim(usize),
    Drop(usize),
    Prepend(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        proptest::collection::vec(any::<u8>(), 0..100).prop_map(Op::Write),
        (0usize..40).prop_map(Op::Append),
        (0usize..80).prop_map(Op::Trim),
        (0usize..40).prop_map(Op::Drop),
        (0usize..40).prop_map(Op::Prepend),
    ]
}

fn check_lengths(pb: &Pbuf) {
    let total: usize = pb.segments().map(<[u8]>::len).sum();
    assert_eq!(pb.pktlen(), total);
    assert!(pb.flags().contains(Flags::SOP));
    assert!(pb.is_complete());
}

proptest! {
    #[test]
    fn chain_length_is_sum_of_segments(
        headroom in 0usize..48,
        ops in proptest::collection::vec(op(), 1..20),
    ) {
        let pool = BufferPool::new(32, 32, 48);
        let mut model: Vec<u8> = Vec::new();
        let mut pb = pool.alloc(headroom).unwrap();

        for op in ops {
            match op {
                Op::Write(data) => {
                    let written = pb.write(&data, usize::MAX);
                    model.extend_from_slice(&data[..written]);
                },
                Op::Append(n) => {
                    if let Some(region) = pb.append(n) {
                        for byte in region.iter_mut() {
                            *byte = 0xaa;
                        }
                        model.extend(core::iter::repeat(0xaa).take(n));
                    }
                },
                Op::Trim(n) => {
                    pb.trim(n);
                    let keep = model.len() - n.min(model.len());
                    model.truncate(keep);
                },
                Op::Drop(n) => {
                    let fits = n <= pb.buflen();
                    match pb.drop_head(n) {
                        Some(next) => {
                            prop_assert!(fits);
                            model.drain(..n);
                            pb = next;
                        },
                        None => {
                            prop_assert!(!fits);
                            return Ok(());
                        },
                    }
                },
                Op::Prepend(n) => {
                    let fits = n <= pb.headroom();
                    let before = pb.headroom();
                    match pb.prepend(n) {
                        Some(mut next) => {
                            prop_assert!(fits);
                            next.data_mut()[..n].copy_from_slice(&vec![0x55; n]);
                            let mut front = vec![0x55; n];
                            front.extend_from_slice(&model);
                            model = front;
                            prop_assert_eq!(next.headroom(), before - n);
                            pb = next;
                        },
                        None => {
                            prop_assert!(!fits);
                            return Ok(());
                        },
                    }
                },
            }
            check_lengths(&pb);
            prop_assert_eq!(pb.to_vec(), model.clone());
        }

        drop(pb);
        prop_assert_eq!(pool.available(), 32);
    }

    #[test]
    fn prepend_then_drop_is_identity(
        payload in proptest::collection::vec(any::<u8>(), 0..40),
        header in 0usize..24,
    ) {
        let pool = BufferPool::new(4, 4, 64);
        let pb = pool.alloc_from(24, &payload).unwrap();
        let pb = pb.prepend(header).unwrap();
        prop_assert_eq!(pb.pktlen(), payload.len() + header);
        let pb = pb.drop_head(header).unwrap();
        prop_assert_eq!(pb.to_vec(), payload);
        prop_assert_eq!(pb.headroom(), 24);
    }
}
