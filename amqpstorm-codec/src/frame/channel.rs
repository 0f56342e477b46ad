use super::{AMQPFrame, Channel, MethodFrameArgs};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChannelCloseArgs {
    pub code: u16,
    pub text: String,
    pub class_id: u16,
    pub method_id: u16,
}

impl ChannelCloseArgs {
    pub fn new(code: u16, text: &str, class_method: u32) -> Self {
        let (class_id, method_id) = super::split_class_method(class_method);

        Self {
            code,
            text: text.to_string(),
            class_id,
            method_id,
        }
    }

    pub fn frame(self, channel: Channel) -> AMQPFrame {
        AMQPFrame::Method(channel, super::CHANNEL_CLOSE, MethodFrameArgs::ChannelClose(self))
    }
}

/// Arguments of `Channel.Flow` and `Channel.FlowOk`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChannelFlowArgs {
    pub active: bool,
}

impl ChannelFlowArgs {
    pub fn new(active: bool) -> Self {
        Self { active }
    }

    pub fn frame(self, channel: Channel) -> AMQPFrame {
        AMQPFrame::Method(channel, super::CHANNEL_FLOW, MethodFrameArgs::ChannelFlow(self))
    }

    pub fn ok_frame(self, channel: Channel) -> AMQPFrame {
        AMQPFrame::Method(channel, super::CHANNEL_FLOW_OK, MethodFrameArgs::ChannelFlowOk(self))
    }
}

pub fn channel_open(channel: Channel) -> AMQPFrame {
    AMQPFrame::Method(channel, super::CHANNEL_OPEN, MethodFrameArgs::ChannelOpen)
}

pub fn channel_open_ok(channel: Channel) -> AMQPFrame {
    AMQPFrame::Method(channel, super::CHANNEL_OPEN_OK, MethodFrameArgs::ChannelOpenOk)
}

pub fn channel_close_ok(channel: Channel) -> AMQPFrame {
    AMQPFrame::Method(channel, super::CHANNEL_CLOSE_OK, MethodFrameArgs::ChannelCloseOk)
}
