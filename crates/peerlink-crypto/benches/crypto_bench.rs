//! Performance benchmarks for peerlink-crypto.
//!
//! Run with: `cargo bench -p peerlink-crypto`

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use peerlink_crypto::{
    IdentityKeyPair, MessagingKeyPair, SessionKey, decrypt_large, encrypt_large,
};

// ============================================================================
// RSA Block Codec
// ============================================================================

fn bench_block_codec(c: &mut Criterion) {
    let identity = IdentityKeyPair::generate().unwrap();
    let mut group = c.benchmark_group("block_codec");

    for size in [190usize, 450, 1024] {
        let plaintext = vec![0xA5u8; size];
        let ciphertext = encrypt_large(identity.public_key(), &plaintext).unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("encrypt", size), &size, |b, _| {
            b.iter(|| encrypt_large(identity.public_key(), black_box(&plaintext)))
        });
        group.bench_with_input(BenchmarkId::new("decrypt", size), &size, |b, _| {
            b.iter(|| decrypt_large(&identity, black_box(&ciphertext)))
        });
    }

    group.finish();
}

// ============================================================================
// Session Envelopes
// ============================================================================

fn bench_session_seal(c: &mut Criterion) {
    let key = SessionKey::from_shared_secret(&[0x42u8; 32]).unwrap();
    let mut group = c.benchmark_group("session_seal");

    for size in [64usize, 1024, 16384] {
        let plaintext = vec![0xAA; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| key.seal(black_box(&plaintext)))
        });
    }

    group.finish();
}

fn bench_key_agreement(c: &mut Criterion) {
    let alice = MessagingKeyPair::generate();
    let bob = MessagingKeyPair::generate();
    c.bench_function("ecdh_p256_agree", |b| {
        b.iter(|| alice.agree(black_box(bob.public_key())))
    });
}

criterion_group!(codec_benches, bench_block_codec);
criterion_group!(session_benches, bench_session_seal, bench_key_agreement);
criterion_main!(codec_benches, session_benches);
