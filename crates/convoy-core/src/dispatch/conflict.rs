use crate::models::resource::{Decision, Operation};

/// Decide whether a proposed operation may proceed against one already in
/// flight on the same resource.
///
/// Reads never wait on an in-flight update, but a second update does. That
/// asymmetry is intentional: updates are non-exclusive metadata changes and
/// reads against them are safe, while concurrent updates must serialize.
pub fn decide(pending: Operation, proposed: Operation) -> Decision {
    match (pending, proposed) {
        (Operation::Create, Operation::Create) => Decision::Reject,
        (Operation::Create, _) => Decision::Postpone,

        (Operation::Read, Operation::Read) => Decision::Accept,
        (Operation::Read, _) => Decision::Postpone,

        (Operation::Update, Operation::Read) => Decision::Accept,
        (Operation::Update, _) => Decision::Postpone,

        (Operation::Delete, Operation::Create) => Decision::Postpone,
        (Operation::Delete, _) => Decision::Reject,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Decision::{Accept, Postpone, Reject};
    use Operation::{Create, Delete, Read, Update};

    // Rows are pending operations, columns proposed, in CRUD order.
    const EXPECTED: [[Decision; 4]; 4] = [
        [Reject, Postpone, Postpone, Postpone],
        [Postpone, Accept, Postpone, Postpone],
        [Postpone, Accept, Postpone, Postpone],
        [Postpone, Reject, Reject, Reject],
    ];

    #[test]
    fn every_cell_matches_the_canonical_table() {
        for (row, pending) in Operation::ALL.into_iter().enumerate() {
            for (column, proposed) in Operation::ALL.into_iter().enumerate() {
                assert_eq!(
                    decide(pending, proposed),
                    EXPECTED[row][column],
                    "decide({pending:?}, {proposed:?})"
                );
            }
        }
    }

    #[test]
    fn reads_do_not_wait_on_updates_but_updates_queue() {
        // Deliberate asymmetry inherited from the conflict policy: do not
        // "fix" this to make updates and reads symmetric.
        assert_eq!(decide(Update, Read), Accept);
        assert_eq!(decide(Update, Update), Postpone);
        assert_eq!(decide(Read, Update), Postpone);
    }

    #[test]
    fn deletes_reject_everything_but_create() {
        assert_eq!(decide(Delete, Read), Reject);
        assert_eq!(decide(Delete, Update), Reject);
        assert_eq!(decide(Delete, Delete), Reject);
        assert_eq!(decide(Delete, Create), Postpone);
    }
}
