//! Linux SCSI generic (sg) driver interface.
//!
//! `sys` carries the raw uapi surface; `device` opens and prepares sg file
//! descriptors; `transport` submits and collects individual commands over the
//! v3 or v4 interface; `share` manages the kernel buffer-share link between a
//! reader fd and a writer fd.

pub mod device;
pub mod share;
pub mod sys;
pub mod transport;
