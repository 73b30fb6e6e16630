//! Suffix-array binary diff
//!
//! The classic BSDIFF-4 algorithm (Colin Percival) without its outer file
//! framing: the suffix array of the old buffer is built with the
//! Larsson-Sadakane qsufsort, the new buffer is scanned for approximate
//! matches, and each match becomes an add-delta record, literal extra bytes
//! and a source seek, all emitted straight into the delta opcode stream.
//!
//! The dominant memory cost is both buffers plus one machine word per old
//! byte for the suffix array, which is why the per-file size limit exists.

use std::io::Write;

use crate::delta::DeltaWriter;
use crate::error::Result;

/// Diff `new` against `old`, emitting opcodes for the current source file.
///
/// The writer must already be positioned at offset 0 of the source file
/// holding `old`. Applying the emitted records reproduces `new` exactly.
pub fn bsdiff<W: Write>(old: &[u8], new: &[u8], writer: &mut DeltaWriter<W>) -> Result<()> {
    let mut suffixes = vec![0i64; old.len() + 1];
    qsufsort(&mut suffixes, old);

    let old_len = old.len() as i64;
    let new_len = new.len() as i64;

    let mut db: Vec<u8> = Vec::new();

    let mut scan: i64 = 0;
    let mut len: i64 = 0;
    let mut pos: i64 = 0;
    let mut lastscan: i64 = 0;
    let mut lastpos: i64 = 0;
    let mut lastoffset: i64 = 0;

    while scan < new_len {
        let mut oldscore: i64 = 0;
        scan += len;
        let mut scsc = scan;

        while scan < new_len {
            len = search(
                &suffixes,
                old,
                &new[scan as usize..],
                0,
                old_len,
                &mut pos,
            );

            while scsc < scan + len {
                if scsc + lastoffset < old_len
                    && old[(scsc + lastoffset) as usize] == new[scsc as usize]
                {
                    oldscore += 1;
                }
                scsc += 1;
            }
            if (len == oldscore && len != 0) || len > oldscore + 8 {
                break;
            }
            if scan + lastoffset < old_len
                && old[(scan + lastoffset) as usize] == new[scan as usize]
            {
                oldscore -= 1;
            }
            scan += 1;
        }

        if len != oldscore || scan == new_len {
            // Extend the previous match region forward as long as more than
            // half the bytes agree.
            let mut s: i64 = 0;
            let mut sf: i64 = 0;
            let mut lenf: i64 = 0;
            let mut i: i64 = 0;
            while lastscan + i < scan && lastpos + i < old_len {
                if old[(lastpos + i) as usize] == new[(lastscan + i) as usize] {
                    s += 1;
                }
                i += 1;
                if s * 2 - i > sf * 2 - lenf {
                    sf = s;
                    lenf = i;
                }
            }

            // And the new match region backward.
            let mut lenb: i64 = 0;
            if scan < new_len {
                let mut s: i64 = 0;
                let mut sb: i64 = 0;
                let mut i: i64 = 1;
                while scan >= lastscan + i && pos >= i {
                    if old[(pos - i) as usize] == new[(scan - i) as usize] {
                        s += 1;
                    }
                    if s * 2 - i > sb * 2 - lenb {
                        sb = s;
                        lenb = i;
                    }
                    i += 1;
                }
            }

            // The extensions may overlap; split at the best net match count.
            if lastscan + lenf > scan - lenb {
                let overlap = (lastscan + lenf) - (scan - lenb);
                let mut s: i64 = 0;
                let mut ss: i64 = 0;
                let mut lens: i64 = 0;
                for i in 0..overlap {
                    if new[(lastscan + lenf - overlap + i) as usize]
                        == old[(lastpos + lenf - overlap + i) as usize]
                    {
                        s += 1;
                    }
                    if new[(scan - lenb + i) as usize] == old[(pos - lenb + i) as usize] {
                        s -= 1;
                    }
                    if s > ss {
                        ss = s;
                        lens = i + 1;
                    }
                }
                lenf += lens - overlap;
                lenb -= lens;
            }

            let dblen = lenf as usize;
            let eblen = ((scan - lenb) - (lastscan + lenf)) as usize;
            let ebpos = (lastscan + lenf) as usize;
            let slen = (pos - lenb) - (lastpos + lenf);

            db.clear();
            for i in 0..dblen {
                db.push(new[lastscan as usize + i].wrapping_sub(old[lastpos as usize + i]));
            }

            writer.write_add_content(&db)?;
            writer.write_content(&new[ebpos..ebpos + eblen])?;
            writer.seek_forward(slen)?;

            lastscan = scan - lenb;
            lastpos = pos - lenb;
            lastoffset = pos - scan;
        }
    }
    Ok(())
}

fn match_len(a: &[u8], b: &[u8]) -> i64 {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count() as i64
}

/// Binary search the suffix array for the longest prefix of `new` found in
/// `old`, storing its position in `pos`.
fn search(suffixes: &[i64], old: &[u8], new: &[u8], st: i64, en: i64, pos: &mut i64) -> i64 {
    if en - st < 2 {
        let x = match_len(&old[suffixes[st as usize] as usize..], new);
        let y = match_len(&old[suffixes[en as usize] as usize..], new);
        if x > y {
            *pos = suffixes[st as usize];
            x
        } else {
            *pos = suffixes[en as usize];
            y
        }
    } else {
        let mid = st + (en - st) / 2;
        let suffix = suffixes[mid as usize] as usize;
        let cmp_len = (old.len() - suffix).min(new.len());
        if old[suffix..suffix + cmp_len] < new[..cmp_len] {
            search(suffixes, old, new, mid, en, pos)
        } else {
            search(suffixes, old, new, st, mid, pos)
        }
    }
}

/// Larsson-Sadakane suffix sort with h-doubling.
///
/// `sa` must hold `buf.len() + 1` entries. Sorted runs are encoded as
/// negative lengths during the passes; on return `sa` is the suffix array
/// including the empty suffix at rank 0.
fn qsufsort(sa: &mut [i64], buf: &[u8]) {
    let n = buf.len();
    let mut buckets = [0i64; 256];
    let mut v = vec![0i64; n + 1];

    for &b in buf {
        buckets[b as usize] += 1;
    }
    for i in 1..256 {
        buckets[i] += buckets[i - 1];
    }
    for i in (1..256).rev() {
        buckets[i] = buckets[i - 1];
    }
    buckets[0] = 0;

    for i in 0..n {
        buckets[buf[i] as usize] += 1;
        sa[buckets[buf[i] as usize] as usize] = i as i64;
    }
    sa[0] = n as i64;
    for i in 0..n {
        v[i] = buckets[buf[i] as usize];
    }
    v[n] = 0;
    for i in 1..256 {
        if buckets[i] == buckets[i - 1] + 1 {
            sa[buckets[i] as usize] = -1;
        }
    }
    sa[0] = -1;

    let mut h: i64 = 1;
    while sa[0] != -(n as i64 + 1) {
        let mut run: i64 = 0;
        let mut i: i64 = 0;
        while i < n as i64 + 1 {
            if sa[i as usize] < 0 {
                run -= sa[i as usize];
                i -= sa[i as usize];
            } else {
                if run != 0 {
                    sa[(i - run) as usize] = -run;
                }
                let group_len = v[sa[i as usize] as usize] + 1 - i;
                split(sa, &mut v, i, group_len, h);
                i += group_len;
                run = 0;
            }
        }
        if run != 0 {
            sa[(i - run) as usize] = -run;
        }
        h += h;
    }

    for i in 0..=n {
        sa[v[i] as usize] = i as i64;
    }
}

/// Three-way partition of one unsorted group around the middle pivot
fn split(sa: &mut [i64], v: &mut [i64], start: i64, len: i64, h: i64) {
    if len < 16 {
        // selection sort of equal-key runs
        let mut k = start;
        while k < start + len {
            let mut j: i64 = 1;
            let mut x = v[(sa[k as usize] + h) as usize];
            let mut i: i64 = 1;
            while k + i < start + len {
                let key = v[(sa[(k + i) as usize] + h) as usize];
                if key < x {
                    x = key;
                    j = 0;
                }
                if key == x {
                    sa.swap((k + j) as usize, (k + i) as usize);
                    j += 1;
                }
                i += 1;
            }
            for i in 0..j {
                v[sa[(k + i) as usize] as usize] = k + j - 1;
            }
            if j == 1 {
                sa[k as usize] = -1;
            }
            k += j;
        }
        return;
    }

    let x = v[(sa[(start + len / 2) as usize] + h) as usize];
    let mut smaller: i64 = 0;
    let mut equal: i64 = 0;
    for i in start..start + len {
        let key = v[(sa[i as usize] + h) as usize];
        if key < x {
            smaller += 1;
        } else if key == x {
            equal += 1;
        }
    }
    let jj = start + smaller;
    let kk = jj + equal;

    let mut i = start;
    let mut j: i64 = 0;
    let mut k: i64 = 0;
    while i < jj {
        let key = v[(sa[i as usize] + h) as usize];
        if key < x {
            i += 1;
        } else if key == x {
            sa.swap(i as usize, (jj + j) as usize);
            j += 1;
        } else {
            sa.swap(i as usize, (kk + k) as usize);
            k += 1;
        }
    }
    while jj + j < kk {
        if v[(sa[(jj + j) as usize] + h) as usize] == x {
            j += 1;
        } else {
            sa.swap((jj + j) as usize, (kk + k) as usize);
            k += 1;
        }
    }

    if jj > start {
        split(sa, v, start, jj - start, h);
    }
    for i in 0..kk - jj {
        v[sa[(jj + i) as usize] as usize] = kk - 1;
    }
    if jj == kk - 1 {
        sa[jj as usize] = -1;
    }
    if start + len > kk {
        split(sa, v, kk, start + len - kk, h);
    }
}
