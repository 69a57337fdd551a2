//! Raspberry Pi 40-pin header mapping.
//!
//! Only BCM GPIO 0-27 are routed to the header; anything else in the
//! configuration is rejected at startup.

/// BCM GPIO number -> physical header pin.
const HEADER_PINS: [(u8, u8); 28] = [
    (0, 27),  // EEPROM SDA
    (1, 28),  // EEPROM SCL
    (2, 3),   // I2C1 SDA
    (3, 5),   // I2C1 SCL
    (4, 7),   // GPCLK0
    (5, 29),
    (6, 31),
    (7, 26),  // SPI0 CE1
    (8, 24),  // SPI0 CE0
    (9, 21),  // SPI0 MISO
    (10, 19), // SPI0 MOSI
    (11, 23), // SPI0 SCLK
    (12, 32), // PWM0
    (13, 33), // PWM1
    (14, 8),  // UART TX
    (15, 10), // UART RX
    (16, 36),
    (17, 11),
    (18, 12), // PCM CLK
    (19, 35), // PCM FS
    (20, 38), // PCM DIN
    (21, 40), // PCM DOUT
    (22, 15),
    (23, 16),
    (24, 18),
    (25, 22),
    (26, 37),
    (27, 13),
];

/// Physical header pin for a BCM GPIO number, if it is routed to the header.
pub fn header_pin(gpio: u8) -> Option<u8> {
    HEADER_PINS
        .iter()
        .find(|(bcm, _)| *bcm == gpio)
        .map(|(_, header)| *header)
}
