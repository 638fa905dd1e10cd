/// Operator command, decoded by the link bridge and applied by the lock manager.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OperatorCommand {
    StartTracking,
    StopTracking,
    SelectTargetById(u32),
    SelectTargetByPixel { u: f32, v: f32 },
    SetDepthRange { min_m: f32, max_m: f32 },
    ClearLock,
    RequestTrackList,
}

impl OperatorCommand {
    pub fn name(&self) -> &'static str {
        match self {
            OperatorCommand::StartTracking => "START_TRACKING",
            OperatorCommand::StopTracking => "STOP_TRACKING",
            OperatorCommand::SelectTargetById(_) => "SELECT_TARGET_ID",
            OperatorCommand::SelectTargetByPixel { .. } => "SELECT_TARGET_PIXEL",
            OperatorCommand::SetDepthRange { .. } => "SET_DEPTH_RANGE",
            OperatorCommand::ClearLock => "CLEAR_LOCK",
            OperatorCommand::RequestTrackList => "REQUEST_TRACK_LIST",
        }
    }
}

/// Commands decoded during one bridge tick. `seq` increases by one per batch so a
/// reader can notice batches it never saw.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandBatch {
    pub seq: u64,
    pub commands: Vec<OperatorCommand>,
}
