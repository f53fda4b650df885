use infersim_core::BlockHasher;

const MODEL: &str = "Qwen/Qwen2-0.5B";

fn tokens(n: usize) -> Vec<u32> {
    (0..n as u32).collect()
}

#[test]
fn deriving_is_deterministic() {
    let a = BlockHasher::new("seed", 16).token_blocks(MODEL, &tokens(64));
    let b = BlockHasher::new("seed", 16).token_blocks(MODEL, &tokens(64));
    assert_eq!(a.len(), 4);
    assert_eq!(a, b);
}

#[test]
fn leading_fingerprints_depend_only_on_the_prefix() {
    let hasher = BlockHasher::new("seed", 16);
    let short = hasher.token_blocks(MODEL, &tokens(32));
    let mut extended = tokens(32);
    extended.extend([900, 901, 902, 903, 904, 905, 906, 907, 908, 909, 910, 911, 912, 913, 914, 915]);
    let long = hasher.token_blocks(MODEL, &extended);
    assert_eq!(long.len(), 3);
    assert_eq!(&long[..2], &short[..]);
}

#[test]
fn identical_blocks_at_different_offsets_differ() {
    let hasher = BlockHasher::new("seed", 8);
    let block: Vec<u32> = (0..8).collect();
    let mut twice = block.clone();
    twice.extend(&block);
    let fps = hasher.token_blocks(MODEL, &twice);
    assert_eq!(fps.len(), 2);
    assert_ne!(fps[0], fps[1]);
}

#[test]
fn trailing_partial_block_is_ignored() {
    let hasher = BlockHasher::new("seed", 16);
    assert_eq!(hasher.token_blocks(MODEL, &tokens(15)).len(), 0);
    assert_eq!(hasher.token_blocks(MODEL, &tokens(16)).len(), 1);
    assert_eq!(hasher.token_blocks(MODEL, &tokens(31)).len(), 1);
    assert_eq!(
        hasher.token_blocks(MODEL, &tokens(31)),
        hasher.token_blocks(MODEL, &tokens(16))
    );
}

#[test]
fn seed_and_model_perturb_fingerprints() {
    let base = BlockHasher::new("seed", 16).token_blocks(MODEL, &tokens(16));
    let other_seed = BlockHasher::new("seed2", 16).token_blocks(MODEL, &tokens(16));
    let other_model = BlockHasher::new("seed", 16).token_blocks("other/model", &tokens(16));
    assert_ne!(base, other_seed);
    assert_ne!(base, other_model);
}
