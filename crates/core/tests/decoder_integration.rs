//! End-to-end decoder runs against scripted logits.

use batchdec_core::beam::{apply_length_penalty, EarlyStopping};
use batchdec_core::decoder::{DecoderBatch, DecoderBatchInput, DraftTokens, Request, SlotHandle};
use batchdec_core::{DecodeError, DecoderSetup, DecodingMode, SamplingConfig};
use candle_core::{Device, Tensor};

const END: u32 = 0;

fn row(vocab: usize, peak: u32) -> Vec<f32> {
    (0..vocab)
        .map(|j| if j as u32 == peak { 5.0 } else { 0.1 * j as f32 })
        .collect()
}

fn logits(rows: &[Vec<f32>]) -> Tensor {
    let vocab = rows[0].len();
    let flat: Vec<f32> = rows.iter().flatten().copied().collect();
    Tensor::from_vec(flat, (rows.len(), vocab), &Device::Cpu).unwrap()
}

fn peaked(vocab: usize, peaks: &[u32]) -> Tensor {
    logits(&peaks.iter().map(|&p| row(vocab, p)).collect::<Vec<_>>())
}

fn setup(max_batch_size: usize) -> DecoderSetup {
    DecoderSetup {
        max_batch_size,
        max_sequence_length: 16,
        ..Default::default()
    }
}

fn u32s(t: Tensor) -> Vec<u32> {
    t.flatten_all().unwrap().to_vec1().unwrap()
}

fn f32s(t: Tensor) -> Vec<f32> {
    t.flatten_all().unwrap().to_vec1().unwrap()
}

/// Slot `s` emits end at step `s`, otherwise `(s + t) % 3 + 1`.
fn scripted_token(slot: usize, step: usize) -> u32 {
    if slot == step {
        END
    } else {
        ((slot + step) % 3 + 1) as u32
    }
}

#[test]
fn greedy_batch_follows_argmax_until_end_or_length() {
    let vocab = 4;
    let mut decoder = DecoderBatch::new(vocab, vocab);
    decoder.setup(setup(6)).unwrap();
    let config = SamplingConfig {
        top_k: 1,
        top_p: 1.0,
        ..Default::default()
    };
    let handles: Vec<SlotHandle> = (0..6)
        .map(|s| {
            decoder
                .new_request(s, Request::new(vec![3], 5, END), config.clone())
                .unwrap()
        })
        .collect();

    for step in 0..6 {
        let input = DecoderBatchInput::new(
            (0..6)
                .map(|s| Some(peaked(vocab, &[scripted_token(s, step)])))
                .collect(),
        );
        decoder.forward(input).unwrap();
    }

    let lens = u32s(decoder.sequence_lengths().unwrap());
    let finished = u32s(decoder.finished().unwrap().to_dtype(candle_core::DType::U32).unwrap());
    for (s, handle) in handles.iter().enumerate() {
        let generated = s.min(5);
        assert_eq!(lens[s] as usize, 1 + generated, "slot {s}");
        let ids = u32s(decoder.output_ids(*handle).unwrap());
        let expected: Vec<u32> = (0..generated).map(|t| scripted_token(s, t)).collect();
        assert_eq!(&ids[1..1 + generated], expected.as_slice(), "slot {s}");
        let expected_flag = if s < 5 { 1 } else { 4 };
        assert_eq!(finished[s], expected_flag, "slot {s}");
    }
    assert_eq!(decoder.nb_finished().unwrap(), 6);
    // Every slot is finished, so the last step wrote the end token everywhere.
    assert_eq!(u32s(decoder.new_tokens(0).unwrap()), vec![END; 6]);
}

#[test]
fn fixed_seed_sampling_is_reproducible() {
    let vocab = 8;
    let run = || {
        let mut decoder = DecoderBatch::new(vocab, vocab);
        decoder.setup(setup(2)).unwrap();
        let config = SamplingConfig::top_k(4).with_seed(7);
        for s in 0..2 {
            decoder
                .new_request(s, Request::new(vec![1], 6, END), config.clone())
                .unwrap();
        }
        let flat: Vec<f32> = (0..vocab).map(|j| (j as f32).sin()).collect();
        for _ in 0..6 {
            let l = logits(&[flat.clone()]);
            decoder
                .forward(DecoderBatchInput::new(vec![Some(l.clone()), Some(l)]))
                .unwrap();
        }
        u32s(decoder.output_ids_all().unwrap())
    };
    assert_eq!(run(), run());
}

#[test]
fn top_k_sampling_stays_in_vocab() {
    let vocab = 4;
    for seed in 0..20 {
        let mut decoder = DecoderBatch::new(vocab, vocab);
        decoder.setup(setup(1)).unwrap();
        decoder
            .new_request(0, Request::new(vec![1], 3, 99), SamplingConfig::top_k(4).with_seed(seed))
            .unwrap();
        for _ in 0..3 {
            let l = logits(&[vec![0.5, 0.1, 0.9, 0.3]]);
            decoder.forward(DecoderBatchInput::new(vec![Some(l)])).unwrap();
        }
        let tokens = u32s(decoder.output_ids_all().unwrap());
        assert!(tokens[1..4].iter().all(|&t| (t as usize) < vocab));
    }
}

#[test]
fn zero_temperature_decodes_greedily() {
    let vocab = 4;
    for seed in 0..20 {
        let mut decoder = DecoderBatch::new(vocab, vocab);
        decoder.setup(setup(1)).unwrap();
        let config = SamplingConfig {
            temperature: 0.0,
            ..SamplingConfig::top_k(4).with_seed(seed)
        };
        decoder
            .new_request(0, Request::new(vec![1], 3, 99), config)
            .unwrap();
        for _ in 0..3 {
            let l = logits(&[vec![1.0, 1.1, 1.0, 1.0]]);
            decoder.forward(DecoderBatchInput::new(vec![Some(l)])).unwrap();
        }
        let tokens = u32s(decoder.output_ids_all().unwrap());
        assert_eq!(&tokens[1..4], &[1, 1, 1], "seed {seed}");
    }
}

#[test]
fn top_k_above_cap_rejected_before_any_work() {
    let vocab = 4;
    let mut decoder = DecoderBatch::new(vocab, vocab);
    decoder
        .setup(DecoderSetup {
            max_top_k: 1024,
            ..setup(1)
        })
        .unwrap();
    let err = decoder
        .new_request(0, Request::new(vec![1], 4, END), SamplingConfig::top_k(1025))
        .unwrap_err();
    assert!(matches!(err, DecodeError::UnsupportedParameter { value: 1025, max: 1024, .. }));
    assert_eq!(decoder.nb_steps().unwrap(), vec![0]);
}

#[test]
fn beam_search_always_stops_at_beam_width_completions() {
    let vocab = 8;
    let beams = 4;
    let mut decoder = DecoderBatch::new(vocab, vocab);
    decoder
        .setup(DecoderSetup {
            mode: DecodingMode::BeamSearch,
            max_beam_width: beams,
            ..setup(1)
        })
        .unwrap();
    let config = SamplingConfig {
        beam_width: beams,
        early_stopping: EarlyStopping::Always,
        length_penalty: 1.0,
        ..Default::default()
    };
    let handle = decoder
        .new_request(0, Request::new(vec![5], 10, END), config)
        .unwrap();

    // End is the single best continuation of every beam. One beam completes
    // at step 0, two at step 1 and the fourth at step 2.
    let beam_row: Vec<f32> = (0..vocab).map(|j| 3.0 - 0.1 * j as f32).collect();
    let mut done_at = None;
    for step in 0..10 {
        let l = logits(&vec![beam_row.clone(); beams]);
        let report = decoder.forward(DecoderBatchInput::new(vec![Some(l)])).unwrap();
        if report.newly_finished.contains(&0) {
            done_at = Some(step);
            break;
        }
    }
    assert_eq!(done_at, Some(2));
    assert_eq!(decoder.nb_steps().unwrap(), vec![3]);

    decoder.finalize(handle).unwrap().wait().unwrap();
    let ids = u32s(decoder.output_ids(handle).unwrap());
    let lens = u32s(decoder.sequence_lengths().unwrap());
    let cum = f32s(decoder.cum_log_probs().unwrap());

    // Every finalized beam is a completed one: no live beam was merged in.
    for b in 0..beams {
        let len = lens[b] as usize;
        assert_eq!(ids[b * 16], 5);
        assert_eq!(ids[b * 16 + len - 1], END, "beam {b} does not end with the end token");
    }
    let mut sorted_lens = lens[..beams].to_vec();
    sorted_lens.sort_unstable();
    assert_eq!(sorted_lens, vec![2, 3, 3, 4]);

    let normed: Vec<f32> = (0..beams)
        .map(|b| apply_length_penalty(cum[b], lens[b] as usize - 1, 1.0))
        .collect();
    for w in normed.windows(2) {
        assert!(w[0] >= w[1], "beams not sorted by normalized score: {normed:?}");
    }
}

#[test]
fn readmission_invalidates_old_handle() {
    let mut decoder = DecoderBatch::new(4, 4);
    decoder.setup(setup(1)).unwrap();
    let old = decoder
        .new_request(0, Request::new(vec![1], 4, END), SamplingConfig::greedy())
        .unwrap();
    let new = decoder
        .new_request(0, Request::new(vec![2], 4, END), SamplingConfig::greedy())
        .unwrap();
    assert!(matches!(decoder.slot_stats(old), Err(DecodeError::StaleSlot { .. })));
    assert!(matches!(decoder.finalize(old), Err(DecodeError::StaleSlot { .. })));
    assert!(decoder.slot_stats(new).is_ok());
}

#[test]
fn device_fault_poisons_the_batch() {
    let vocab = 4;
    let mut decoder = DecoderBatch::new(vocab, vocab);
    decoder.setup(setup(2)).unwrap();
    for s in 0..2 {
        decoder
            .new_request(s, Request::new(vec![1], 4, END), SamplingConfig::greedy())
            .unwrap();
    }
    decoder
        .forward(DecoderBatchInput::new(vec![
            Some(peaked(vocab, &[2])),
            Some(peaked(vocab, &[3])),
        ]))
        .unwrap();

    let bad = logits(&[vec![0.0, f32::NAN, 0.0, 0.0]]);
    let err = decoder
        .forward(DecoderBatchInput::new(vec![Some(peaked(vocab, &[2])), Some(bad)]))
        .unwrap_err();
    assert!(matches!(err, DecodeError::Device(_)));
    assert!(err.is_fatal());

    let again = decoder.forward_async(DecoderBatchInput::new(vec![Some(peaked(vocab, &[2])), None]));
    assert!(matches!(again, Err(DecodeError::BatchFaulted)));
    // Results drained before the fault stay readable.
    assert_eq!(decoder.nb_steps().unwrap(), vec![1, 1]);

    decoder.setup(setup(2)).unwrap();
    assert_eq!(decoder.nb_steps().unwrap(), vec![0, 0]);
}

#[test]
fn fused_and_unfused_produce_identical_outputs() {
    let vocab = 6;
    let run = |fused: bool| {
        let mut decoder = DecoderBatch::new(vocab, vocab);
        decoder
            .setup(DecoderSetup {
                fused_decoder: fused,
                num_streams: 2,
                ..setup(3)
            })
            .unwrap();
        for s in 0..3 {
            let config = SamplingConfig::top_p(0.8).with_seed(s as u64 + 11);
            decoder
                .new_request(s, Request::new(vec![1, 2], 8, END), config)
                .unwrap();
        }
        for step in 0..8 {
            let input = DecoderBatchInput::new(
                (0..3)
                    .map(|s| {
                        let r: Vec<f32> = (0..vocab)
                            .map(|j| ((j * 7 + s * 3 + step) % 5) as f32 * 0.4)
                            .collect();
                        Some(logits(&[r]))
                    })
                    .collect(),
            );
            decoder.forward(input).unwrap();
        }
        (
            u32s(decoder.output_ids_all().unwrap()),
            u32s(decoder.sequence_lengths().unwrap()),
        )
    };
    assert_eq!(run(true), run(false));
}

#[test]
fn padded_vocabulary_columns_are_ignored() {
    let mut decoder = DecoderBatch::new(4, 8);
    decoder.setup(setup(1)).unwrap();
    let handle = decoder
        .new_request(0, Request::new(vec![1], 1, END), SamplingConfig::greedy())
        .unwrap();
    let padded = logits(&[vec![0.0, 0.0, 0.0, 2.0, 9.0, 9.0, 9.0, 9.0]]);
    decoder.forward(DecoderBatchInput::new(vec![Some(padded)])).unwrap();
    assert_eq!(u32s(decoder.output_ids(handle).unwrap())[1], 3);
}

#[test]
fn medusa_accepts_tree_path_and_proposes_drafts() {
    let vocab = 4;
    let mut decoder = DecoderBatch::new(vocab, vocab);
    decoder
        .setup(DecoderSetup {
            mode: DecodingMode::Medusa,
            max_tokens_per_step: 3,
            medusa_choices: Some(vec![vec![0], vec![0, 0]]),
            ..setup(2)
        })
        .unwrap();
    let handle = decoder
        .new_request(
            0,
            Request::new(vec![1], 8, END).with_draft_tokens(DraftTokens::new(vec![2, 3])),
            SamplingConfig::greedy(),
        )
        .unwrap();
    decoder
        .new_request(1, Request::new(vec![1], 8, END), SamplingConfig::greedy())
        .unwrap();

    // Slot 0: targets 2, 3, 1 accept both drafts. Slot 1 has no drafts.
    let mut heads = vec![0.0f32; 3 * 2 * vocab];
    heads[2 * 2 * vocab + 1] = 4.0;
    heads[2 * 2 * vocab + vocab + 2] = 4.0;
    let input = DecoderBatchInput::new(vec![Some(peaked(vocab, &[2, 3, 1])), Some(peaked(vocab, &[3, 3, 3]))])
        .with_medusa_logits(vec![
            Some(Tensor::from_vec(heads, (3, 2, vocab), &Device::Cpu).unwrap()),
            None,
        ]);
    decoder.forward(input).unwrap();

    assert_eq!(&u32s(decoder.output_ids(handle).unwrap())[..4], &[1, 2, 3, 1]);
    assert_eq!(u32s(decoder.accepted_lengths_cumsum().unwrap()), vec![0, 2, 2]);
    assert_eq!(u32s(decoder.accepted_packed_paths().unwrap()), vec![0, 1]);
    assert_eq!(u32s(decoder.next_draft_tokens().unwrap()), vec![1, 2, 0, 0]);
    assert_eq!(u32s(decoder.all_new_tokens().unwrap()), vec![2, 3, 3, 0, 1, 0]);
    let stats = decoder.slot_stats(handle).unwrap();
    assert_eq!(stats.draft_tokens_accepted, 2);
    assert_eq!(stats.generated_tokens_per_step, vec![3]);
}

#[test]
fn external_drafts_by_ids_and_by_logits() {
    let vocab = 4;
    let mut decoder = DecoderBatch::new(vocab, vocab);
    decoder
        .setup(DecoderSetup {
            mode: DecodingMode::ExternalDraftTokens,
            max_tokens_per_step: 4,
            ..setup(2)
        })
        .unwrap();
    let by_ids = decoder
        .new_request(0, Request::new(vec![1], 8, END), SamplingConfig::greedy())
        .unwrap();
    let config = SamplingConfig {
        accept_draft_by_logits: true,
        ..SamplingConfig::greedy().with_seed(3)
    };
    let by_logits = decoder
        .new_request(1, Request::new(vec![1], 8, END), config)
        .unwrap();

    // Slot 1: the draft model agrees with a target that is certain of each
    // token, so every draft is kept.
    let certain = |peaks: &[u32]| {
        logits(
            &peaks
                .iter()
                .map(|&p| (0..vocab).map(|j| if j as u32 == p { 30.0 } else { 0.0 }).collect())
                .collect::<Vec<_>>(),
        )
    };
    let input = DecoderBatchInput::new(vec![Some(peaked(vocab, &[2, 1, 3])), Some(certain(&[3, 2, 1]))])
        .with_drafts(vec![
            Some(DraftTokens::new(vec![2, 3])),
            Some(DraftTokens::new(vec![3, 2]).with_logits(certain(&[3, 2]))),
        ]);
    decoder.forward(input).unwrap();

    assert_eq!(&u32s(decoder.output_ids(by_ids).unwrap())[..3], &[1, 2, 1]);
    assert_eq!(&u32s(decoder.output_ids(by_logits).unwrap())[..4], &[1, 3, 2, 1]);
    assert_eq!(u32s(decoder.accepted_lengths_cumsum().unwrap()), vec![0, 1, 3]);
    assert_eq!(decoder.slot_stats(by_logits).unwrap().draft_tokens_accepted, 2);
}

#[test]
fn tensor_parallel_partial_logits_reduce_before_decoding() {
    use batchdec_core::distributed::{AllReduceBuffers, IpcWorld, ReduceOp};

    // Each rank holds a partial sum; neither partial alone peaks at token 3.
    let partials = [vec![0.0f32, 3.0, 0.0, 2.5], vec![0.0, 0.0, 0.0, 1.0]];
    let world = IpcWorld::new(2);
    let reduced: Vec<Vec<f32>> = std::thread::scope(|s| {
        let handles: Vec<_> = partials
            .iter()
            .enumerate()
            .map(|(rank, partial)| {
                let world = world.clone();
                s.spawn(move || {
                    let buffers = AllReduceBuffers::new(&world, rank, 4).unwrap();
                    buffers.all_reduce(partial, ReduceOp::Sum).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(reduced[0], reduced[1]);

    let mut decoder = DecoderBatch::new(4, 4);
    decoder.setup(setup(1)).unwrap();
    decoder
        .new_request(0, Request::new(vec![1], 2, END), SamplingConfig::greedy())
        .unwrap();
    decoder
        .forward(DecoderBatchInput::new(vec![Some(logits(&[reduced[0].clone()]))]))
        .unwrap();
    assert_eq!(u32s(decoder.output_ids_all().unwrap())[1], 3);
}
