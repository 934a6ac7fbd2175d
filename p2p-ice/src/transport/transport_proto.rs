use super::*;

impl sansio::Protocol<SocketData, Packet, SocketNotice> for Transport {
    type Rout = Packet;
    type Wout = TaggedBytesMut;
    type Eout = TransportEvent;
    type Error = Error;
    type Time = Instant;

    fn handle_read(&mut self, msg: SocketData) -> std::result::Result<(), Self::Error> {
        self.handle_socket_data(msg)
    }

    fn poll_read(&mut self) -> Option<Self::Rout> {
        self.reads.pop_front()
    }

    fn handle_write(&mut self, msg: Packet) -> std::result::Result<(), Self::Error> {
        self.send(&msg.data, msg.now)?;
        Ok(())
    }

    fn poll_write(&mut self) -> Option<Self::Wout> {
        self.transmits.pop_front()
    }

    fn handle_event(&mut self, evt: SocketNotice) -> std::result::Result<(), Self::Error> {
        self.handle_socket_event(evt.event, evt.now)
    }

    fn poll_event(&mut self) -> Option<Self::Eout> {
        self.events.pop_front()
    }

    fn handle_timeout(&mut self, now: Self::Time) -> std::result::Result<(), Self::Error> {
        self.on_timeout(now);
        Ok(())
    }

    fn poll_timeout(&mut self) -> Option<Self::Time> {
        self.next_timeout()
    }

    fn close(&mut self) -> std::result::Result<(), Self::Error> {
        self.shutdown();
        Ok(())
    }
}
