use crate::mac_address::MacAddress;

/// A stable MAC address for unit tests.
pub const TEST_MAC: MacAddress = MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

/// Build an LE advertising report frame from `mac` carrying raw AD bytes.
///
/// Layout: packet type, event code, parameter length, subevent, report count,
/// event type, address type, address (6 bytes, reversed), data length, data,
/// RSSI.
pub fn frame_with_payload(mac: MacAddress, ad_data: &[u8]) -> Vec<u8> {
    let mut addr = mac.0;
    addr.reverse();

    let mut frame = vec![0x04, 0x3E, 0x00, 0x02, 0x01, 0x00, 0x00];
    frame.extend_from_slice(&addr);
    frame.push(ad_data.len() as u8);
    frame.extend_from_slice(ad_data);
    frame.push(0xC4); // RSSI -60 dBm
    frame[2] = (frame.len() - 3) as u8;
    frame
}

/// A 2JCIE-BU frame: 24.55 °C, 45.20 %, 100 lx, 1013.250 hPa, 38.00 dB,
/// 12 ppb eTVOC, 450 ppm eCO2.
pub fn bu_frame(mac: MacAddress) -> Vec<u8> {
    let ad_data = [
        0x02, 0x01, 0x06, // flags
        0x15, 0xFF, 0xD5, 0x02, // manufacturer data, OMRON
        0x01, // data type
        0x2A, // sequence
        0x97, 0x09, // temperature 2455
        0xA8, 0x11, // humidity 4520
        0x64, 0x00, // ambient light 100
        0x02, 0x76, 0x0F, 0x00, // pressure 1013250
        0xD8, 0x0E, // sound noise 3800
        0x0C, 0x00, // eTVOC 12
        0xC2, 0x01, // eCO2 450
        0x04, 0x09, b'R', b'b', b't', // complete local name
    ];
    frame_with_payload(mac, &ad_data)
}

/// A 2JCIE-BL frame: sequence 255, 22.10 °C, 55.05 %, 321 lx, UV 0.02,
/// 1008.7 hPa, 35.50 dB, DI 68.24, heat stroke 19.83 °C, battery byte 0xC8.
pub fn bl_frame(mac: MacAddress) -> Vec<u8> {
    let ad_data = [
        0x02, 0x01, 0x06, // flags
        0x17, 0xFF, 0xD5, 0x02, // manufacturer data, OMRON
        0xFF, // sequence
        0xA2, 0x08, // temperature 2210
        0x81, 0x15, // humidity 5505
        0x41, 0x01, // ambient light 321
        0x02, 0x00, // UV index 2
        0x67, 0x27, // pressure 10087
        0xDE, 0x0D, // sound noise 3550
        0xA8, 0x1A, // discomfort index 6824
        0xBF, 0x07, // heat stroke 1983
        0x00, 0x00, // reserved
        0xC8, // battery
        0x03, 0x09, b'E', b'P', // complete local name
    ];
    frame_with_payload(mac, &ad_data)
}

#[test]
fn test_frame_offsets() {
    let bu = bu_frame(TEST_MAC);
    assert_eq!(&bu[7..13], &[0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA]);
    assert_eq!(&bu[19..21], &[0xD5, 0x02]);
    assert_eq!(&bu[23..25], &[0x97, 0x09]);
    assert_eq!(&bu[37..39], &[0xC2, 0x01]);
    assert_eq!(bu[2] as usize, bu.len() - 3);

    let bl = bl_frame(TEST_MAC);
    assert_eq!(&bl[19..21], &[0xD5, 0x02]);
    assert_eq!(bl[21], 0xFF);
    assert_eq!(bl[40], 0xC8);
}
