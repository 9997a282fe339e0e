//! Keccak sponge: SHA3-256, SHA3-512, SHAKE-256 and the XDRBG extractor.
//!
//! This is the conditioning heart of the engine. The entropy pool is a
//! SHAKE-256 sponge that absorbs one rate-sized block per jitter sample; the
//! output extractor is the XDRBG construction which squeezes a 256-bit block
//! and reseeds the sponge with the fresh state part, giving enhanced
//! backtracking resistance. A SHA3-512 based XDRBG variant is available via
//! the `drbg-sha3-512` cargo feature.
//!
//! Byte I/O is little-endian. The squeeze is deliberately limited to a single
//! rate-sized block (all digest sizes used here fit into one), which keeps
//! the XDRBG state handling branch-free.

use crate::error::Error;
use crate::platform::{memzero_explicit, memzero_explicit_u64};

/// SHA3-256 digest size in bytes.
pub const SHA3_256_DIGEST: usize = 32;
/// SHA3-512 digest size in bytes.
pub const SHA3_512_DIGEST: usize = 64;
/// Rate of SHA3-256 and SHAKE-256 in bytes.
pub const SHA3_256_BLOCK: usize = 136;
/// Rate of SHA3-512 in bytes.
pub const SHA3_512_BLOCK: usize = 72;
/// Largest rate handled by the partial-block buffer.
pub const MAX_BLOCK: usize = SHA3_256_BLOCK;
/// XDRBG-256 internal state V size in bytes (512 bits).
pub const XDRBG_STATE: usize = 64;

// ---------------------------------------------------------------------------
// Keccak-f[1600]
// ---------------------------------------------------------------------------

const KECCAK_ROUNDS: usize = 24;

const IOTA_RC: [u64; KECCAK_ROUNDS] = [
    0x0000000000000001,
    0x0000000000008082,
    0x800000000000808a,
    0x8000000080008000,
    0x000000000000808b,
    0x0000000080000001,
    0x8000000080008081,
    0x8000000000008009,
    0x000000000000008a,
    0x0000000000000088,
    0x0000000080008009,
    0x000000008000000a,
    0x000000008000808b,
    0x800000000000008b,
    0x8000000000008089,
    0x8000000000008003,
    0x8000000000008002,
    0x8000000000000080,
    0x000000000000800a,
    0x800000008000000a,
    0x8000000080008081,
    0x8000000000008080,
    0x0000000080000001,
    0x8000000080008008,
];

/// Rho rotation offsets for lane `x + 5*y`.
const RHO_OFFSET: [u32; 25] = [
    0, 1, 62, 28, 27, //
    36, 44, 6, 55, 20, //
    3, 10, 43, 25, 39, //
    41, 45, 15, 21, 8, //
    18, 2, 61, 56, 14,
];

/// The Keccak-f[1600] permutation: 24 rounds of theta, rho, pi, chi, iota
/// over the 25-lane state.
fn keccakf(s: &mut [u64; 25]) {
    let mut b = [0u64; 25];

    for &rc in IOTA_RC.iter() {
        // theta
        let mut c = [0u64; 5];
        for x in 0..5 {
            c[x] = s[x] ^ s[x + 5] ^ s[x + 10] ^ s[x + 15] ^ s[x + 20];
        }
        for x in 0..5 {
            let d = c[(x + 4) % 5] ^ c[(x + 1) % 5].rotate_left(1);
            for y in 0..5 {
                s[x + 5 * y] ^= d;
            }
        }

        // rho + pi
        for x in 0..5 {
            for y in 0..5 {
                let src = x + 5 * y;
                let dst = y + 5 * ((2 * x + 3 * y) % 5);
                b[dst] = s[src].rotate_left(RHO_OFFSET[src]);
            }
        }

        // chi
        for y in 0..5 {
            for x in 0..5 {
                s[x + 5 * y] =
                    b[x + 5 * y] ^ ((!b[(x + 1) % 5 + 5 * y]) & b[(x + 2) % 5 + 5 * y]);
            }
        }

        // iota
        s[0] ^= rc;
    }
}

// ---------------------------------------------------------------------------
// Streaming sponge context
// ---------------------------------------------------------------------------

/// Streaming SHA-3 / SHAKE context.
///
/// `finalize` re-initializes the absorbing state, so one context can be used
/// for an unbounded sequence of absorb/squeeze rounds, which is exactly the access
/// pattern of the entropy pool.
pub struct Sha3 {
    state: [u64; 25],
    partial: [u8; MAX_BLOCK],
    fill: usize,
    rate: usize,
    digest_size: usize,
    padding: u8,
    /// XDRBG bookkeeping: whether the first seed has been finalized.
    seeded: bool,
}

impl Sha3 {
    fn with_params(rate: usize, digest_size: usize, padding: u8) -> Self {
        Self {
            state: [0u64; 25],
            partial: [0u8; MAX_BLOCK],
            fill: 0,
            rate,
            digest_size,
            padding,
            seeded: false,
        }
    }

    /// SHA3-256 context (used by the hash-loop noise source).
    pub fn sha3_256() -> Self {
        Self::with_params(SHA3_256_BLOCK, SHA3_256_DIGEST, 0x06)
    }

    /// SHA3-512 context.
    pub fn sha3_512() -> Self {
        Self::with_params(SHA3_512_BLOCK, SHA3_512_DIGEST, 0x06)
    }

    /// SHAKE-256 context with a caller-set digest size.
    pub fn shake256() -> Self {
        Self::with_params(SHA3_256_BLOCK, 0, 0x1f)
    }

    /// Entropy-pool context: SHAKE-256 for XDRBG-256 by default, SHA3-512
    /// when the `drbg-sha3-512` feature selects that extractor variant.
    pub fn pool() -> Self {
        #[cfg(feature = "drbg-sha3-512")]
        {
            Self::sha3_512()
        }
        #[cfg(not(feature = "drbg-sha3-512"))]
        {
            Self::shake256()
        }
    }

    /// Rate in bytes of this context.
    pub fn rate(&self) -> usize {
        self.rate
    }

    /// Set the output size of a SHAKE context. Must be a multiple of 8 and
    /// at most the rate (the squeeze emits a single block).
    pub fn set_digest_size(&mut self, size: usize) {
        debug_assert!(size <= self.rate);
        debug_assert_eq!(size % 8, 0);
        self.digest_size = size;
    }

    fn absorb_block(&mut self, block: &[u8]) {
        for (i, chunk) in block.chunks_exact(8).enumerate().take(self.rate / 8) {
            self.state[i] ^= u64::from_le_bytes(chunk.try_into().unwrap());
        }
        keccakf(&mut self.state);
    }

    /// Absorb message bytes.
    pub fn update(&mut self, mut data: &[u8]) {
        if self.fill > 0 {
            let todo = self.rate - self.fill;
            if data.len() < todo {
                self.partial[self.fill..self.fill + data.len()].copy_from_slice(data);
                self.fill += data.len();
                return;
            }
            self.partial[self.fill..self.rate].copy_from_slice(&data[..todo]);
            data = &data[todo..];
            let block = self.partial;
            self.absorb_block(&block[..self.rate]);
            self.fill = 0;
        }

        while data.len() >= self.rate {
            let (block, rest) = data.split_at(self.rate);
            let mut tmp = [0u8; MAX_BLOCK];
            tmp[..self.rate].copy_from_slice(block);
            self.absorb_block(&tmp[..self.rate]);
            data = rest;
        }

        self.partial[..data.len()].copy_from_slice(data);
        self.fill = data.len();
    }

    /// Pad, permute and squeeze `digest_size` bytes into `digest`, then
    /// re-initialize the absorbing state.
    ///
    /// `digest` must hold at least `digest_size` bytes.
    pub fn finalize(&mut self, digest: &mut [u8]) {
        debug_assert!(digest.len() >= self.digest_size);
        debug_assert!(self.digest_size <= self.rate);

        self.partial[self.fill..self.rate].fill(0);
        self.partial[self.fill] = self.padding;
        self.partial[self.rate - 1] |= 0x80;

        let block = self.partial;
        self.absorb_block(&block[..self.rate]);

        for (i, chunk) in digest[..self.digest_size].chunks_exact_mut(8).enumerate() {
            chunk.copy_from_slice(&self.state[i].to_le_bytes());
        }

        memzero_explicit(&mut self.partial);
        memzero_explicit_u64(&mut self.state);
        self.fill = 0;
    }

    /// Wipe all sensitive state.
    pub fn wipe(&mut self) {
        memzero_explicit_u64(&mut self.state);
        memzero_explicit(&mut self.partial);
        self.fill = 0;
        self.seeded = false;
    }
}

impl Drop for Sha3 {
    fn drop(&mut self) {
        self.wipe();
    }
}

// ---------------------------------------------------------------------------
// XDRBG output extractor
// ---------------------------------------------------------------------------

/// XDRBG domain-separation encoding byte: `n * 85` with n = 0 for the first
/// seeding, 1 for reseeding, 2 for generation.
fn xdrbg_encode(n: u8) -> u8 {
    n.wrapping_mul(85)
}

impl Sha3 {
    /// XDRBG-256 block generation on a SHAKE-256 context.
    ///
    /// Finalizes the absorbed seed material into the 512-bit state V,
    /// generates `T = V' || sigma`, returns up to 256 bits of sigma and
    /// reseeds the sponge with V'. The absorbed entropy therefore both
    /// produces the output block and survives, freshly mixed, inside the
    /// context.
    pub fn xdrbg256_generate(&mut self, dst: &mut [u8]) {
        debug_assert_eq!(self.rate, SHA3_256_BLOCK);

        // V' (64 bytes) followed by sigma (32 bytes).
        let mut t = [0u8; XDRBG_STATE + SHA3_256_DIGEST];

        // Finalize the (re)seed: V <- XOF(encode(seed, n)), |V| = 512 bit.
        let encode = xdrbg_encode(self.seeded as u8);
        self.seeded = true;
        self.update(&[encode]);
        self.set_digest_size(XDRBG_STATE);
        {
            let (v, _) = t.split_at_mut(XDRBG_STATE);
            self.finalize(v);
        }

        // Generate: T <- XOF(encode(V', 2)), keep the first |V| bits as the
        // next state and hand out the rest.
        let v_prev = {
            let mut v = [0u8; XDRBG_STATE];
            v.copy_from_slice(&t[..XDRBG_STATE]);
            v
        };
        self.update(&v_prev);
        self.update(&[xdrbg_encode(2)]);
        self.set_digest_size(t.len());
        self.finalize(&mut t);

        let n = dst.len().min(SHA3_256_DIGEST);
        dst[..n].copy_from_slice(&t[XDRBG_STATE..XDRBG_STATE + n]);

        // Reseed with the fresh V.
        let mut v_next = [0u8; XDRBG_STATE];
        v_next.copy_from_slice(&t[..XDRBG_STATE]);
        self.update(&v_next);

        memzero_explicit(&mut t);
        memzero_explicit(&mut v_next);
        let mut v_prev = v_prev;
        memzero_explicit(&mut v_prev);
    }

    /// XDRBG block generation following the XDRBG flow with SHA3-512 as the
    /// function: V is 512 bits while seeding and 256 bits when reseeding
    /// after generation, the output block is 256 bits.
    pub fn xdrbg_sha3_512_generate(&mut self, dst: &mut [u8]) {
        debug_assert_eq!(self.rate, SHA3_512_BLOCK);

        // V (32 bytes) followed by sigma (32 bytes).
        let mut t = [0u8; SHA3_512_DIGEST];

        let encode = xdrbg_encode(self.seeded as u8);
        self.seeded = true;
        self.update(&[encode]);
        self.finalize(&mut t);

        let t_prev = t;
        self.update(&t_prev);
        self.update(&[xdrbg_encode(2)]);
        self.finalize(&mut t);

        let n = dst.len().min(SHA3_256_DIGEST);
        dst[..n].copy_from_slice(&t[SHA3_256_DIGEST..SHA3_256_DIGEST + n]);

        // Reseed with the 256-bit V half.
        let mut v_next = [0u8; SHA3_256_DIGEST];
        v_next.copy_from_slice(&t[..SHA3_256_DIGEST]);
        self.update(&v_next);

        memzero_explicit(&mut t);
        memzero_explicit(&mut v_next);
        let mut t_prev = t_prev;
        memzero_explicit(&mut t_prev);
    }

    /// Generate one output block with the extractor matching this context's
    /// hash.
    pub fn drbg_generate(&mut self, dst: &mut [u8]) {
        if self.rate == SHA3_512_BLOCK {
            self.xdrbg_sha3_512_generate(dst);
        } else {
            self.xdrbg256_generate(dst);
        }
    }
}

// ---------------------------------------------------------------------------
// Known-answer self-tests
// ---------------------------------------------------------------------------

const SHA3_512_KAT_MSG: [u8; 3] = [0x5e, 0x5e, 0xd6];

const SHA3_512_KAT_EXP: [u8; SHA3_512_DIGEST] = [
    0x73, 0xde, 0xe5, 0x10, 0x3a, 0xe5, 0xc1, 0x7e, 0x38, 0xfa, 0x2c, 0xe2, 0xf4, 0x4b, 0x6f,
    0x4c, 0xca, 0x67, 0x99, 0x1b, 0xdc, 0x9e, 0x9a, 0x9e, 0x23, 0x19, 0xf9, 0xc5, 0x9a, 0x23,
    0x3a, 0x9a, 0xe8, 0x59, 0xb2, 0x83, 0xe1, 0xf2, 0x03, 0x10, 0xf5, 0x96, 0x04, 0x0a, 0x7d,
    0x6a, 0x2c, 0xc9, 0xa5, 0x49, 0xde, 0x80, 0x09, 0x38, 0x4b, 0xb7, 0x0b, 0x0b, 0xe5, 0xa5,
    0x55, 0x66, 0x6a, 0xd7,
];

const XDRBG_KAT_SEED: [u8; 9] = [0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];

const XDRBG256_KAT_EXP: [u8; SHA3_256_DIGEST] = [
    0x51, 0xe4, 0x3c, 0xf6, 0x4b, 0xa2, 0x80, 0x77, 0x33, 0x1a, 0x47, 0xe3, 0xf8, 0xb4, 0x1a,
    0x42, 0xad, 0xd3, 0xa0, 0xf2, 0x53, 0x97, 0x10, 0xdd, 0x6e, 0xa1, 0x16, 0x1d, 0x37, 0x8a,
    0x6f, 0xb6,
];

const XDRBG_SHA3_512_KAT_EXP: [u8; SHA3_256_DIGEST] = [
    0x05, 0xc7, 0x63, 0xb5, 0x89, 0x42, 0xba, 0xe4, 0x00, 0xb9, 0xa8, 0x95, 0xff, 0xaf, 0x71,
    0x9a, 0x8e, 0x18, 0x99, 0x0b, 0xb6, 0x6d, 0x59, 0xd6, 0x3e, 0x20, 0x5a, 0xde, 0xb5, 0x0c,
    0x70, 0x3c,
];

fn sha3_512_kat() -> bool {
    let mut ctx = Sha3::sha3_512();
    let mut act = [0u8; SHA3_512_DIGEST];
    ctx.update(&SHA3_512_KAT_MSG);
    ctx.finalize(&mut act);
    act == SHA3_512_KAT_EXP
}

fn xdrbg256_kat() -> bool {
    let mut ctx = Sha3::shake256();
    let mut act = [0u8; SHA3_256_DIGEST];
    // Initial seed, then a reseed; the vector is the block after the reseed.
    ctx.update(&XDRBG_KAT_SEED);
    ctx.xdrbg256_generate(&mut act);
    ctx.update(&XDRBG_KAT_SEED);
    ctx.xdrbg256_generate(&mut act);
    act == XDRBG256_KAT_EXP
}

fn xdrbg_sha3_512_kat() -> bool {
    let mut ctx = Sha3::sha3_512();
    let mut act = [0u8; SHA3_256_DIGEST];
    ctx.update(&XDRBG_KAT_SEED);
    ctx.xdrbg_sha3_512_generate(&mut act);
    ctx.update(&XDRBG_KAT_SEED);
    ctx.xdrbg_sha3_512_generate(&mut act);
    act == XDRBG_SHA3_512_KAT_EXP
}

/// Run the SHA-3 and XDRBG known-answer tests for the configured extractor.
pub fn self_test() -> Result<(), Error> {
    if !sha3_512_kat() {
        return Err(Error::Hash);
    }
    let drbg_ok = if cfg!(feature = "drbg-sha3-512") {
        xdrbg_sha3_512_kat()
    } else {
        xdrbg256_kat()
    };
    if !drbg_ok {
        return Err(Error::Hash);
    }
    Ok(())
}
