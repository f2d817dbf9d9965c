/// Inbound chat message as delivered to the embedding layer. `text` is the
/// base64 ciphertext exactly as routed; decryption is the embedder's job.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub from: String,
    pub to: String,
    pub text: String,
    pub time: f64,
}

/// Notifications pushed from the receive thread. The UI adapter is
/// responsible for marshalling these onto its own thread.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    MessageReceived(InboundMessage),
    /// Both local lists were refetched; redraw the roster.
    RosterChanged,
    /// The link to the server is gone; the receive loop has stopped.
    ConnectionLost,
}
