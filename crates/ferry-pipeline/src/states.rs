//! State graphs of pipelines and file streams.

use ferry_core::statemachine::Graph;
use std::fmt;

/// State of a [`Pipeline`](crate::Pipeline)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    /// Created, nothing run yet
    Init,
    /// Running pre-tasks
    PreTasks,
    /// Pre-tasks done
    PreTasksDone,
    /// Sending file data
    Reading,
    /// Receiving file data
    Writing,
    /// Closing the data phase
    DataEnd,
    /// Data phase closed
    DataEnded,
    /// Running post-tasks
    PostTasks,
    /// Post-tasks done
    PostTasksDone,
    /// Archiving the transfer
    EndTransfer,
    /// Finished successfully
    AllDone,
    /// Handling an error
    Error,
    /// Finished in error
    InError,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "init",
            Self::PreTasks => "pre-tasks",
            Self::PreTasksDone => "pre-tasks done",
            Self::Reading => "reading",
            Self::Writing => "writing",
            Self::DataEnd => "data end",
            Self::DataEnded => "data ended",
            Self::PostTasks => "post-tasks",
            Self::PostTasksDone => "post-tasks done",
            Self::EndTransfer => "end transfer",
            Self::AllDone => "all done",
            Self::Error => "error",
            Self::InError => "in error",
        })
    }
}

/// Pipeline transition graph
pub static PIPELINE_GRAPH: Graph<PipelineState> = {
    use PipelineState::*;
    Graph::new(
        "pipeline",
        Init,
        &[
            (Init, &[PreTasks, Error]),
            (PreTasks, &[PreTasksDone, Error]),
            (PreTasksDone, &[Reading, Writing, Error]),
            (Reading, &[DataEnd, Error]),
            (Writing, &[DataEnd, Error]),
            (DataEnd, &[DataEnded, Error]),
            (DataEnded, &[PostTasks, Error]),
            (PostTasks, &[PostTasksDone, Error]),
            (PostTasksDone, &[EndTransfer, Error]),
            (EndTransfer, &[AllDone, Error]),
            (Error, &[InError]),
            (AllDone, &[]),
            (InError, &[]),
        ],
    )
};

/// State of a [`FileStream`](crate::FileStream)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    /// File being opened
    Opening,
    /// File open for reading
    Reading,
    /// File open for writing
    Writing,
    /// Checking the file's hash
    HashCheck,
    /// File closed
    Close,
    /// File moved to its final destination
    Move,
    /// Stream finished
    Done,
    /// Stream failed
    Error,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Opening => "opening",
            Self::Reading => "reading",
            Self::Writing => "writing",
            Self::HashCheck => "hash check",
            Self::Close => "close",
            Self::Move => "move",
            Self::Done => "done",
            Self::Error => "error",
        })
    }
}

/// File stream transition graph
pub static STREAM_GRAPH: Graph<StreamState> = {
    use StreamState::*;
    Graph::new(
        "file stream",
        Opening,
        &[
            (Opening, &[Reading, Writing, Error]),
            (Reading, &[HashCheck, Close, Error]),
            (Writing, &[HashCheck, Close, Error]),
            (HashCheck, &[Reading, Writing, Error]),
            (Close, &[Move, Error]),
            (Move, &[Done, Error]),
            (Done, &[]),
            (Error, &[]),
        ],
    )
};
