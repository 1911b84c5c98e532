mod ntp;
