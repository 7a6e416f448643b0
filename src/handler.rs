use crate::message::Message;

/// User-supplied processing logic for consumed messages.
///
/// `Ok(())` acknowledges (consumer groups) or removes (list polling) the
/// message. An error leaves it in place for redelivery; it is logged and never
/// ends the consume loop.
pub trait Handler: Send {
    fn handle(&mut self, msg: &Message) -> anyhow::Result<()>;
}

impl<F> Handler for F
where
    F: FnMut(&Message) -> anyhow::Result<()> + Send,
{
    fn handle(&mut self, msg: &Message) -> anyhow::Result<()> {
        self(msg)
    }
}
