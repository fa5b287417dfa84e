//! Deciding whether a resumed download must first test the server's
//! large-file resume support.
//!
//! Some servers mishandle `REST` offsets past 2 GiB or 4 GiB. Before resuming
//! a local file that large, the last byte of the remote file is requested:
//! if anything other than exactly one byte comes back, the server is buggy
//! for that boundary.

use crate::capabilities::Tri;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeDecision {
    /// Resume normally.
    Proceed,
    /// The local file is already complete. No transfer needed.
    Complete { boundary: u64 },
    /// The server cannot resume past `boundary` and the file is incomplete.
    Fail { boundary: u64 },
    /// Test the server by requesting the last remote byte.
    Probe { boundary: u64 },
}

/// `boundaries` must be sorted largest first. `bug` reports the stored
/// resume-bug capability for a boundary.
pub fn evaluate_resume_probe(
    local_size: u64,
    remote_size: Option<u64>,
    boundaries: &[u64],
    mut bug: impl FnMut(u64) -> Tri,
) -> ProbeDecision {
    for &boundary in boundaries {
        if local_size < boundary {
            continue;
        }
        match bug(boundary) {
            Tri::Yes => {
                return if remote_size == Some(local_size) {
                    ProbeDecision::Complete { boundary }
                } else {
                    ProbeDecision::Fail { boundary }
                };
            }
            Tri::Unknown => match remote_size {
                Some(remote) if remote == local_size => {
                    return ProbeDecision::Complete { boundary };
                }
                Some(remote) if remote > local_size => {
                    return ProbeDecision::Probe { boundary };
                }
                // Remote smaller or unknown: nothing sensible to test.
                _ => {}
            },
            Tri::No => {}
        }
    }
    ProbeDecision::Proceed
}

#[cfg(test)]
mod tests {
    use super::*;

    const GB4: u64 = 1 << 32;
    const GB2: u64 = 1 << 31;
    const BOUNDARIES: [u64; 2] = [GB4, GB2];

    fn unknown(_: u64) -> Tri {
        Tri::Unknown
    }

    #[test]
    fn small_files_never_probe() {
        assert_eq!(
            evaluate_resume_probe(GB2 - 1, Some(GB4), &BOUNDARIES, unknown),
            ProbeDecision::Proceed
        );
    }

    #[test]
    fn remote_larger_probes_largest_crossed_boundary() {
        assert_eq!(
            evaluate_resume_probe(5 * GB2, Some(6 * GB2), &BOUNDARIES, unknown),
            ProbeDecision::Probe { boundary: GB4 }
        );
        assert_eq!(
            evaluate_resume_probe(GB2 + 1, Some(GB4), &BOUNDARIES, unknown),
            ProbeDecision::Probe { boundary: GB2 }
        );
    }

    #[test]
    fn equal_sizes_complete() {
        assert_eq!(
            evaluate_resume_probe(GB4, Some(GB4), &BOUNDARIES, unknown),
            ProbeDecision::Complete { boundary: GB4 }
        );
        assert_eq!(
            evaluate_resume_probe(GB4, Some(GB4), &BOUNDARIES, |_| Tri::Yes),
            ProbeDecision::Complete { boundary: GB4 }
        );
    }

    #[test]
    fn known_bug_fails() {
        assert_eq!(
            evaluate_resume_probe(GB4 + 10, Some(GB4 + 20), &BOUNDARIES, |_| Tri::Yes),
            ProbeDecision::Fail { boundary: GB4 }
        );
    }

    #[test]
    fn remote_smaller_moves_to_next_boundary() {
        let decision = evaluate_resume_probe(GB4 + 10, Some(GB2), &BOUNDARIES, |b| {
            if b == GB2 { Tri::Yes } else { Tri::Unknown }
        });
        assert_eq!(decision, ProbeDecision::Fail { boundary: GB2 });
        assert_eq!(
            evaluate_resume_probe(GB4 + 10, None, &BOUNDARIES, unknown),
            ProbeDecision::Proceed
        );
    }

    #[test]
    fn known_good_is_skipped() {
        assert_eq!(
            evaluate_resume_probe(GB4 + 10, Some(GB4 + 20), &BOUNDARIES, |_| Tri::No),
            ProbeDecision::Proceed
        );
    }
}
