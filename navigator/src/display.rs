//! Waveshare 7.5" monochrome e-paper panel. A full refresh takes seconds and
//! blocks; only the supervisor talks to the display.

use image::GrayImage;

/// Pack an 8-bit grayscale frame into the panel's 1-bit-per-pixel wire
/// format. Pixels below the threshold are driven black.
pub(crate) fn pack_frame(frame: &GrayImage) -> Vec<u8> {
    let (width, height) = frame.dimensions();
    let mut buf = Vec::with_capacity((width as usize).div_ceil(8) * height as usize);

    for y in 0..height {
        for x_byte in 0..width.div_ceil(8) {
            let mut byte = 0u8;
            for bit in 0..8 {
                let x = x_byte * 8 + bit;
                if x < width && frame.get_pixel(x, y).0[0] < 128 {
                    byte |= 1 << (7 - bit);
                }
            }
            buf.push(byte);
        }
    }
    buf
}

#[cfg(feature = "raspberry_pi")]
mod real {
    use super::pack_frame;
    use anyhow::Context;
    use image::GrayImage;
    use image::imageops::FilterType;
    use rppal::gpio::{Gpio, InputPin, OutputPin};
    use rppal::spi::{Bus, Mode, SlaveSelect, Spi};
    use std::time::Duration;
    use tracing::{debug, info};

    const RST_PIN: u8 = 17;
    const DC_PIN: u8 = 25;
    const CS_PIN: u8 = 8;
    const BUSY_PIN: u8 = 24;

    const SPI_CLOCK_HZ: u32 = 4_000_000;
    const SPI_CHUNK: usize = 4096;

    pub struct Epd {
        spi: Spi,
        rst: OutputPin,
        dc: OutputPin,
        cs: OutputPin,
        busy: InputPin,
        width: u32,
        height: u32,
    }

    impl Epd {
        pub fn new(width: u32, height: u32) -> anyhow::Result<Self> {
            let gpio = Gpio::new().context("GPIO unavailable")?;
            let spi = Spi::new(Bus::Spi0, SlaveSelect::Ss0, SPI_CLOCK_HZ, Mode::Mode0)
                .context("SPI unavailable")?;
            Ok(Self {
                spi,
                rst: gpio.get(RST_PIN)?.into_output(),
                dc: gpio.get(DC_PIN)?.into_output(),
                cs: gpio.get(CS_PIN)?.into_output(),
                busy: gpio.get(BUSY_PIN)?.into_input(),
                width,
                height,
            })
        }

        pub fn init(&mut self) -> anyhow::Result<()> {
            self.reset();

            self.command(0x01)?; // POWER_SETTING
            self.data(&[0x07, 0x07, 0x3f, 0x3f])?;

            self.command(0x04)?; // POWER_ON
            self.wait_until_idle();

            self.command(0x00)?; // PANEL_SETTING
            self.data(&[0x1f])?;

            self.command(0x61)?; // RESOLUTION_SETTING: 800 x 480
            self.data(&[0x03, 0x20, 0x01, 0xe0])?;

            self.command(0x15)?;
            self.data(&[0x00])?;

            self.command(0x50)?; // VCOM_AND_DATA_INTERVAL_SETTING
            self.data(&[0x11, 0x07])?;

            self.command(0x60)?; // TCON_SETTING
            self.data(&[0x22])?;

            info!("e-paper display initialized");
            Ok(())
        }

        /// Full-frame update. Blocks for the whole panel refresh.
        pub fn push_frame(&mut self, frame: &GrayImage) -> anyhow::Result<()> {
            let frame = if frame.dimensions() == (self.width, self.height) {
                frame.clone()
            } else {
                image::imageops::resize(frame, self.width, self.height, FilterType::Triangle)
            };

            self.command(0x13)?; // DATA_START_TRANSMISSION_2
            let buf = pack_frame(&frame);
            for chunk in buf.chunks(SPI_CHUNK) {
                self.data(chunk)?;
            }

            self.command(0x12)?; // DISPLAY_REFRESH
            self.wait_until_idle();
            debug!("frame pushed");
            Ok(())
        }

        pub fn clear(&mut self) -> anyhow::Result<()> {
            let white = GrayImage::from_pixel(self.width, self.height, image::Luma([255]));
            self.push_frame(&white)
        }

        pub fn sleep(&mut self) -> anyhow::Result<()> {
            self.command(0x02)?; // POWER_OFF
            self.wait_until_idle();
            self.command(0x07)?; // DEEP_SLEEP
            self.data(&[0xa5])?;
            Ok(())
        }

        fn reset(&mut self) {
            self.rst.set_high();
            std::thread::sleep(Duration::from_millis(200));
            self.rst.set_low();
            std::thread::sleep(Duration::from_millis(200));
            self.rst.set_high();
            std::thread::sleep(Duration::from_millis(200));
        }

        fn command(&mut self, command: u8) -> anyhow::Result<()> {
            self.dc.set_low();
            self.cs.set_low();
            self.spi.write(&[command])?;
            self.cs.set_high();
            Ok(())
        }

        fn data(&mut self, data: &[u8]) -> anyhow::Result<()> {
            self.dc.set_high();
            self.cs.set_low();
            self.spi.write(data)?;
            self.cs.set_high();
            Ok(())
        }

        fn wait_until_idle(&self) {
            while self.busy.is_high() {
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

#[cfg(not(feature = "raspberry_pi"))]
mod dummy {
    use image::GrayImage;
    use tracing::debug;

    /// Stand-in panel for development machines: keeps the last frame so
    /// tests and tooling can look at what would have been shown.
    pub struct Epd {
        width: u32,
        height: u32,
        last_frame: Option<GrayImage>,
    }

    impl Epd {
        pub fn new(width: u32, height: u32) -> anyhow::Result<Self> {
            Ok(Self {
                width,
                height,
                last_frame: None,
            })
        }

        pub fn init(&mut self) -> anyhow::Result<()> {
            debug!(width = self.width, height = self.height, "dummy display initialized");
            Ok(())
        }

        pub fn push_frame(&mut self, frame: &GrayImage) -> anyhow::Result<()> {
            self.last_frame = Some(frame.clone());
            Ok(())
        }

        pub fn clear(&mut self) -> anyhow::Result<()> {
            self.last_frame = None;
            Ok(())
        }

        pub fn sleep(&mut self) -> anyhow::Result<()> {
            Ok(())
        }

        #[allow(dead_code)]
        pub fn last_frame(&self) -> Option<&GrayImage> {
            self.last_frame.as_ref()
        }
    }
}

#[cfg(feature = "raspberry_pi")]
pub use real::Epd;

#[cfg(not(feature = "raspberry_pi"))]
pub use dummy::Epd;

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn packing_sets_bits_for_dark_pixels() {
        let mut frame = GrayImage::from_pixel(16, 2, Luma([255]));
        frame.put_pixel(0, 0, Luma([0]));
        frame.put_pixel(7, 0, Luma([10]));
        frame.put_pixel(8, 1, Luma([127]));

        let buf = pack_frame(&frame);
        assert_eq!(buf.len(), 4);
        assert_eq!(buf[0], 0b1000_0001);
        assert_eq!(buf[1], 0);
        assert_eq!(buf[2], 0);
        assert_eq!(buf[3], 0b1000_0000);
    }

    #[test]
    fn packing_pads_non_byte_widths() {
        let frame = GrayImage::from_pixel(10, 1, Luma([0]));
        let buf = pack_frame(&frame);
        assert_eq!(buf.len(), 2);
        assert_eq!(buf[0], 0xff);
        // Only the two leftmost bits of the second byte are real pixels.
        assert_eq!(buf[1], 0b1100_0000);
    }

    #[cfg(not(feature = "raspberry_pi"))]
    #[test]
    fn dummy_panel_retains_last_frame() {
        let mut epd = Epd::new(32, 16).unwrap();
        epd.init().unwrap();
        assert!(epd.last_frame().is_none());

        let frame = GrayImage::from_pixel(32, 16, Luma([42]));
        epd.push_frame(&frame).unwrap();
        assert_eq!(epd.last_frame().unwrap().get_pixel(0, 0).0[0], 42);

        epd.clear().unwrap();
        assert!(epd.last_frame().is_none());
    }
}
